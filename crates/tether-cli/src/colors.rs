//! Terminal colors for command output.
//!
//! Colors are on by default and turned off by `--no-color` or the
//! `NO_COLOR` environment variable.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use comfy_table::{Cell, Color};
use owo_colors::OwoColorize;

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Honor `NO_COLOR` (any non-empty value).
pub fn init(no_color_flag: bool) {
    let no_color_env = std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty());
    if no_color_flag || no_color_env {
        disable_colors();
    }
}

/// How a worker name is highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStyle {
    Plain,
    Running,
    Disabled,
}

impl NameStyle {
    fn color(self) -> Option<Color> {
        match self {
            Self::Plain => None,
            Self::Running => Some(Color::Green),
            Self::Disabled => Some(Color::Red),
        }
    }
}

/// A worker name for line output.
pub fn name(text: &str, style: NameStyle) -> String {
    if !colors_enabled() {
        return text.to_string();
    }
    match style {
        NameStyle::Plain => text.to_string(),
        NameStyle::Running => text.green().to_string(),
        NameStyle::Disabled => text.red().to_string(),
    }
}

/// A worker name for table output.
pub fn name_cell(text: &str, style: NameStyle) -> Cell {
    let cell = Cell::new(text);
    match style.color().filter(|_| colors_enabled()) {
        Some(color) => cell.fg(color),
        None => cell,
    }
}

/// Placeholder for a value that is missing or unknown.
pub fn placeholder_cell(text: &str) -> Cell {
    let cell = Cell::new(text);
    if colors_enabled() {
        cell.fg(Color::Blue)
    } else {
        cell
    }
}

/// Highlight a name or value inside a message.
pub fn emphasis(value: impl Display) -> String {
    if colors_enabled() {
        value.yellow().to_string()
    } else {
        value.to_string()
    }
}
