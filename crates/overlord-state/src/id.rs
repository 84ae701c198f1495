//! Change and task identifiers

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub(crate) fn from_counter(n: u64) -> Self {
                Self(n.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Numeric value of the id, if it was issued by a [`crate::State`].
            pub fn number(&self) -> Option<u64> {
                self.0.parse().ok()
            }
        }

        // Issued ids are decimal strings; order them numerically so "10" sorts after "9".
        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                match (self.number(), other.number()) {
                    (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
                    _ => self.0.cmp(&other.0),
                }
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

numeric_id!(
    /// Change identifier, unique and increasing within one state.
    ChangeId
);

numeric_id!(
    /// Task identifier, unique and increasing within one state.
    TaskId
);
