//! `tether list` - show the named shared workers and their state.

use std::io::Write;

use anyhow::Result;
use comfy_table::{Cell, ContentArrangement, Table, presets::ASCII_HORIZONTAL_ONLY};
use tether_core::{Error, Registry, SocketAddress, WorkerStatus};

use crate::colors::{self, NameStyle};

/// Table headers for the long format.
pub const HEADERS: [&str; 6] = ["Flags", "Name", "Factory", "PID", "Network address", "Status"];

const LEGEND: [&str; 3] = [
    "l = Running (live), r = Remote, a = Admin cookie present",
    "d = Disabled, k = Kill switch present, e = Eagerly starting",
    "d implies k",
];

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub long: bool,
    pub color_names: bool,
    pub no_status: bool,
    pub remote_status: bool,
    pub factory: Option<String>,
}

impl ListOptions {
    /// Apply the implications between flags: `-l` implies `-c`, status is
    /// only queried for colored output, `-x` overrides `-r`.
    pub fn new(
        long: bool,
        color_names: bool,
        no_status: bool,
        remote_status: bool,
        factory: Option<String>,
    ) -> Self {
        let color_names = long || color_names;
        let no_status = !color_names || no_status;
        let remote_status = !no_status && remote_status;
        Self {
            long,
            color_names,
            no_status,
            remote_status,
            factory,
        }
    }
}

/// The five per-worker flags, in display order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub live: bool,
    pub remote: bool,
    pub admin_cookie: bool,
    pub disabled: bool,
    pub kill_switch: bool,
    pub eager: bool,
}

impl Flags {
    pub fn render(&self) -> String {
        let disabled = if self.disabled {
            'd'
        } else if self.kill_switch {
            'k'
        } else {
            '-'
        };
        [
            if self.live { 'l' } else { '-' },
            if self.remote { 'r' } else { '-' },
            if self.admin_cookie { 'a' } else { '-' },
            disabled,
            if self.eager { 'e' } else { '-' },
        ]
        .iter()
        .collect()
    }

    pub fn name_style(&self) -> NameStyle {
        if self.live {
            NameStyle::Running
        } else if self.disabled {
            NameStyle::Disabled
        } else {
            NameStyle::Plain
        }
    }
}

/// What was learned about one worker.
#[derive(Debug)]
struct WorkerData {
    address: SocketAddress,
    pid: Option<u32>,
    status: Option<WorkerStatus>,
}

pub fn execute(registry: &Registry, options: &ListOptions) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run(registry, options, &mut out)
}

/// Print the list. A worker that can't be inspected gets a failure line
/// after the listing; the others are still shown.
pub fn run(registry: &Registry, options: &ListOptions, out: &mut impl Write) -> Result<()> {
    let mut table = options.long.then(new_table);
    let mut failures = Vec::new();

    for name in registry.shared_worker_names() {
        let factory = match registry.shared_worker_factory_name(name) {
            Ok(factory) => factory,
            Err(e) => {
                failures.push((name, e));
                continue;
            }
        };
        if options.factory.as_deref().is_some_and(|f| f != factory) {
            continue;
        }

        if !options.color_names {
            writeln!(out, "{}", name)?;
            continue;
        }

        let (data, flags) = match inspect(registry, name, options) {
            Ok(inspected) => inspected,
            Err(e) => {
                failures.push((name, e));
                continue;
            }
        };

        match table.as_mut() {
            Some(table) => {
                table.add_row(row(name, factory, &data, &flags));
            }
            None => writeln!(out, "{}", colors::name(name, flags.name_style()))?,
        }
    }

    if let Some(table) = table {
        writeln!(out, "Flags legend:")?;
        for line in LEGEND {
            writeln!(out, "{}", line)?;
        }
        writeln!(out, "{table}")?;
    }

    for (name, e) in failures {
        writeln!(out, "Failed to inspect worker {}: {}", name, e)?;
    }

    Ok(())
}

fn inspect(
    registry: &Registry,
    name: &str,
    options: &ListOptions,
) -> tether_core::Result<(WorkerData, Flags)> {
    let data = gather(registry, name, options)?;
    let flags = flags(registry, name, &data)?;
    Ok((data, flags))
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_HORIZONTAL_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(HEADERS);
    table
}

fn gather(registry: &Registry, name: &str, options: &ListOptions) -> tether_core::Result<WorkerData> {
    let address = registry.shared_worker_address(name)?.clone();
    let pid = registry.shared_worker_process_id(name)?;

    let query = if address.is_local() {
        !options.no_status
    } else {
        options.remote_status
    };

    let status = if query {
        match registry.query_shared_worker(name) {
            Ok(status) => Some(status),
            Err(Error::Connect { .. }) => None,
            Err(e) => {
                tracing::warn!("Could not query shared worker {}: {}", name, e);
                None
            }
        }
    } else {
        None
    };

    Ok(WorkerData {
        address,
        pid,
        status,
    })
}

fn flags(registry: &Registry, name: &str, data: &WorkerData) -> tether_core::Result<Flags> {
    let profile = registry.shared_worker_factory(name)?.profile();
    let mut flags = Flags {
        live: data.pid.is_some() || data.status.is_some(),
        admin_cookie: profile.admin_cookie().is_some(),
        eager: registry.is_shared_worker_eagerly_starting(name)?,
        ..Flags::default()
    };

    if !data.address.is_local() {
        flags.remote = true;
    } else if is_disabled(registry, name) {
        flags.disabled = true;
    } else if profile.kill_switch_path().is_some() {
        flags.kill_switch = true;
    }

    Ok(flags)
}

/// An unreadable kill switch shows as not disabled.
fn is_disabled(registry: &Registry, name: &str) -> bool {
    registry.is_shared_worker_disabled(name).unwrap_or_else(|e| {
        tracing::warn!("Could not read the kill switch of {}: {}", name, e);
        false
    })
}

fn row(name: &str, factory: &str, data: &WorkerData, flags: &Flags) -> Vec<Cell> {
    vec![
        Cell::new(flags.render()),
        colors::name_cell(name, flags.name_style()),
        Cell::new(factory),
        match data.pid {
            Some(pid) => Cell::new(pid),
            None => colors::placeholder_cell("unknown"),
        },
        if data.address.is_network_exposed() {
            Cell::new(data.address.strip_scheme())
        } else {
            colors::placeholder_cell("local-only")
        },
        match &data.status {
            Some(status) => Cell::new(&status.text),
            None => colors::placeholder_cell("no data"),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;
    use tether_core::Config;

    fn registry(root: &Path) -> Registry {
        colors::disable_colors();
        let config = Config::parse(&format!(
            r#"
[paths]
root = "{}"

[shared_workers.alpha]
expression = "Echo"
eager_start = true

[shared_workers.beta]
address = "tcp://worker.example.com:7000"
expression = "Echo"
factory = "remote"

[factories.remote.bootstrap_profile]
admin_cookie = "s3cret"
"#,
            root.display()
        ))
        .unwrap();
        config.build_registry().unwrap()
    }

    fn output(registry: &Registry, options: ListOptions) -> String {
        let mut out = Vec::new();
        run(registry, &options, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_long_implies_color_and_status() {
        let options = ListOptions::new(true, false, false, true, None);
        assert!(options.color_names);
        assert!(!options.no_status);
        assert!(options.remote_status);

        let options = ListOptions::new(false, false, false, true, None);
        assert!(options.no_status);
        assert!(!options.remote_status);

        let options = ListOptions::new(true, false, true, true, None);
        assert!(!options.remote_status);
    }

    #[test]
    fn test_flag_rendering() {
        let flags = Flags {
            live: true,
            admin_cookie: true,
            disabled: true,
            kill_switch: true,
            ..Flags::default()
        };
        assert_eq!(flags.render(), "l-ad-");
        assert_eq!(flags.name_style(), NameStyle::Running);

        let flags = Flags {
            remote: true,
            eager: true,
            ..Flags::default()
        };
        assert_eq!(flags.render(), "-r--e");
        assert_eq!(Flags::default().render(), "-----");
    }

    #[test]
    fn test_plain_list_prints_names() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());
        assert_eq!(output(&registry, ListOptions::default()), "alpha\nbeta\n");
    }

    #[test]
    fn test_factory_filter() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());
        let options = ListOptions::new(false, false, false, false, Some("remote".to_string()));
        assert_eq!(output(&registry, options), "beta\n");
    }

    #[test]
    fn test_long_list_rows() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());
        let text = output(&registry, ListOptions::new(true, false, false, false, None));

        assert!(text.starts_with("Flags legend:"));
        assert!(text.contains("Network address"));

        let alpha = text.lines().find(|l| l.contains("alpha")).unwrap();
        assert!(alpha.contains("---ke"));
        assert!(alpha.contains("unknown"));
        assert!(alpha.contains("local-only"));
        assert!(alpha.contains("no data"));

        let beta = text.lines().find(|l| l.contains("beta")).unwrap();
        assert!(beta.contains("-ra--"));
        assert!(beta.contains("worker.example.com:7000"));
    }

    #[test]
    fn test_disabled_worker_is_flagged() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());
        registry.disable_shared_worker("alpha").unwrap();

        let text = output(&registry, ListOptions::new(true, false, true, false, None));
        let alpha = text.lines().find(|l| l.contains("alpha")).unwrap();
        assert!(alpha.contains("---de"));
    }

    #[test]
    fn test_listing_continues_after_bad_worker() {
        colors::disable_colors();
        let temp = TempDir::new().unwrap();
        let config = Config::parse(&format!(
            r#"
[paths]
root = "{}"

[shared_workers.a]
factory = "ghost"
expression = "Echo"

[shared_workers.b]
expression = "Echo"
"#,
            temp.path().display()
        ))
        .unwrap();
        let registry = config.build_registry().unwrap();

        let text = output(&registry, ListOptions::new(true, false, true, false, None));
        let b = text.lines().find(|l| l.contains(" b ")).unwrap();
        assert!(b.contains("---k-"));
        assert!(text.contains("Failed to inspect worker a: unknown worker factory: ghost"));

        // The plain list needs nothing from the factory.
        assert_eq!(output(&registry, ListOptions::default()), "a\nb\n");
    }
}
