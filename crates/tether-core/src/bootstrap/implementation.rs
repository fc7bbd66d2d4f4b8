//! What a worker runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Source of a worker implementation.
///
/// Exactly one of these is given per shared worker; the worker runtime
/// evaluates it to produce `workerImpl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImplementationSource {
    /// Instantiation expression in the worker runtime's expression language,
    /// e.g. `Echo` or `Counter(5)`.
    Expression { text: String },
    /// Named service, resolved through the worker's global scope.
    ServiceRef { name: String },
    /// Built-in implementation class with its constructor argument expressions.
    ClassRef { name: String, arguments: Vec<String> },
}

impl ImplementationSource {
    pub fn expression(text: impl Into<String>) -> Self {
        Self::Expression { text: text.into() }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::ServiceRef { name: name.into() }
    }

    pub fn class(name: impl Into<String>, arguments: Vec<String>) -> Self {
        Self::ClassRef {
            name: name.into(),
            arguments,
        }
    }

    /// Resolve the three mutually exclusive configuration keys.
    ///
    /// `class_arguments` are the owning factory's constructor argument
    /// expressions; they only apply to a class reference. Giving none of the
    /// keys yields `None`, giving more than one is an
    /// [`Error::AmbiguousDefinition`].
    pub fn from_definition(
        worker_name: &str,
        expression: Option<&str>,
        service: Option<&str>,
        class: Option<&str>,
        class_arguments: &[String],
    ) -> Result<Option<Self>> {
        let given: Vec<&str> = [
            expression.map(|_| "an instantiation expression"),
            service.map(|_| "a service identifier"),
            class.map(|_| "a class name"),
        ]
        .into_iter()
        .flatten()
        .collect();

        if given.len() > 1 {
            return Err(Error::AmbiguousDefinition(format!(
                "shared worker \"{}\" can't have {} at the same time",
                worker_name,
                join_with_and(&given)
            )));
        }

        Ok(match (expression, service, class) {
            (Some(text), _, _) => Some(Self::expression(text)),
            (_, Some(name), _) => Some(Self::service(name)),
            (_, _, Some(name)) => Some(Self::class(name, class_arguments.to_vec())),
            _ => None,
        })
    }
}

fn join_with_and(items: &[&str]) -> String {
    match items {
        [] => String::new(),
        [one] => one.to_string(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

impl fmt::Display for ImplementationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expression { text } => write!(f, "{}", text),
            Self::ServiceRef { name } => write!(f, "service({})", name),
            Self::ClassRef { name, arguments } if arguments.is_empty() => write!(f, "{}", name),
            Self::ClassRef { name, arguments } => write!(f, "{}({})", name, arguments.join(", ")),
        }
    }
}
