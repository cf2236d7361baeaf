//! ABOUTME: Identifier types shared across the Pilot workflow engine
//! ABOUTME: StepId, ExecutionId, and other UUID-backed newtypes

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Deterministic id derived from a stable name, so the same
            /// logical entity (e.g. a step authored with a fixed string id
            /// in the workflow definition) always resolves to the same id.
            #[must_use]
            pub fn from_name(name: &str) -> Self {
                Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
            }

            #[must_use]
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_name(s)
            }
        }
    };
}

uuid_id!(ExecutionId, "Unique identifier for one execution (run) of an agent's workflow.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_is_deterministic() {
        let a = ExecutionId::from_name("exec-1");
        let b = ExecutionId::from_name("exec-1");
        assert_eq!(a, b);
    }

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
    }
}
