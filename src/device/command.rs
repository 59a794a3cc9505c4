//! Command identifiers, values and qualifiers.

use crate::error::AvError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// A status or command value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Integer view. Text holding a decimal integer counts.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Text(text) => text.trim().parse().ok(),
            Value::Float(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Int(n) => n.into(),
            Value::Float(x) => x.into(),
            Value::Text(text) => text.into(),
        }
    }
}

/// Named parameters that select one instance of a command, e.g.
/// `{"Input": "2"}` for the second multi-view window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Qualifier(BTreeMap<String, Value>);

impl Qualifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add one parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Values of `parameters` in order, stopping at the first missing one.
    pub(crate) fn path(&self, parameters: &[&str]) -> Vec<String> {
        parameters
            .iter()
            .map_while(|name| self.0.get(*name).map(ToString::to_string))
            .collect()
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Identifier of one command of a driver.
///
/// Implemented by the enums generated with `command_set!`.
pub trait CommandId:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + FromStr<Err = AvError> + Send + Sync + 'static
{
    /// The pseudo-command under which connection status is reported.
    const CONNECTION_STATUS: Self;

    /// Qualifier parameter names, in lookup order.
    fn parameters(self) -> &'static [&'static str];

    /// Every command of the set.
    fn all() -> &'static [Self];
}

/// Key of one stored status: the command plus its qualifier values in
/// parameter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StatusKey<C> {
    pub(crate) command: C,
    pub(crate) path: Vec<String>,
}

impl<C: CommandId> StatusKey<C> {
    /// Full key, or `None` when the qualifier lacks a parameter.
    pub(crate) fn full(command: C, qualifier: &Qualifier) -> Option<Self> {
        let parameters = command.parameters();
        let path = qualifier.path(parameters);
        (path.len() == parameters.len()).then_some(Self { command, path })
    }
}

/// Define a command enum with its names and qualifier parameters.
///
/// ```ignore
/// command_set! {
///     pub enum Command {
///         ConnectionStatus => "ConnectionStatus",
///         MultipleInput => "MultipleInput" ["Input"],
///     }
/// }
/// ```
macro_rules! command_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $text:literal $( [ $($param:literal),* ] )?
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )+
        }

        impl $name {
            /// Every command of this set.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(match self {
                    $($name::$variant => $text,)+
                })
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::AvError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::AvError::UnknownCommand(other.to_string())),
                }
            }
        }

        impl $crate::device::CommandId for $name {
            const CONNECTION_STATUS: Self = $name::ConnectionStatus;

            fn parameters(self) -> &'static [&'static str] {
                match self {
                    $($name::$variant => &[$($($param),*)?],)+
                }
            }

            fn all() -> &'static [Self] {
                Self::ALL
            }
        }
    };
}
pub(crate) use command_set;
