//! Newtype identifiers for plans and nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// First 8 hex characters, used in snapshot worktree directory names.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(PlanId);
uuid_id!(NodeId);

/// A human-readable identifier unique within its group scope, used in
/// dependency references (e.g. `"backend/migrate-schema"`).
///
/// Must match `^[a-z0-9]([a-z0-9-]{1,62}[a-z0-9])?$` per path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(pub String);

impl ProducerId {
    const PATTERN: &'static str = r"^[a-z0-9]([a-z0-9-]{1,62}[a-z0-9])?$";

    pub fn validate(segment: &str) -> bool {
        use std::sync::OnceLock;
        static RE: OnceLock<regex::Regex> = OnceLock::new();
        RE.get_or_init(|| regex::Regex::new(ProducerId::PATTERN).expect("static pattern"))
            .is_match(segment)
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_id_accepts_simple_names() {
        assert!(ProducerId::validate("migrate-schema"));
        assert!(ProducerId::validate("a"));
        assert!(ProducerId::validate("ab"));
    }

    #[test]
    fn producer_id_rejects_bad_segments() {
        assert!(!ProducerId::validate(""));
        assert!(!ProducerId::validate("-leading-dash"));
        assert!(!ProducerId::validate("trailing-dash-"));
        assert!(!ProducerId::validate("Has_Upper"));
        assert!(!ProducerId::validate(&"x".repeat(65)));
    }

    #[test]
    fn short_id_is_eight_chars() {
        let id = PlanId::new(Uuid::nil());
        assert_eq!(id.short(), "00000000");
    }
}
