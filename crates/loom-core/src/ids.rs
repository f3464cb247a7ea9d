//! Branded ID newtypes for type safety.
//!
//! Every entity in the store has a distinct ID type implemented as a newtype
//! wrapper around `String`. This prevents accidentally passing a message ID
//! where a branch ID is expected.
//!
//! Generated IDs are prefixed UUID v7 strings (`msg_0190...`), so they sort by
//! creation time. IDs coming from imports or older data are accepted verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for freshly generated IDs.
            pub const PREFIX: &'static str = $prefix;

            /// Create a new random ID (prefixed UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a conversation.
    ConversationId, "conv"
}

branded_id! {
    /// Unique identifier for a message slot.
    MessageId, "msg"
}

branded_id! {
    /// Unique identifier for a content variant of a message.
    BranchId, "br"
}

branded_id! {
    /// Identifier of an application user (issued by the auth layer).
    UserId, "user"
}

/// Literal value used for a branch with no parent.
pub const ROOT_PARENT: &str = "root";

/// Parent pointer of a branch: the literal `root`, or a branch of another message.
///
/// Serialized as a plain string so the wire format matches `parentBranchId`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParentRef {
    /// Top of the tree.
    Root,
    /// A branch belonging to some other message.
    Branch(BranchId),
}

impl ParentRef {
    /// The branch this points at, if any.
    pub fn branch(&self) -> Option<&BranchId> {
        match self {
            Self::Root => None,
            Self::Branch(id) => Some(id),
        }
    }

    /// Whether this is the `root` sentinel.
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }
}

impl From<String> for ParentRef {
    fn from(s: String) -> Self {
        if s == ROOT_PARENT {
            Self::Root
        } else {
            Self::Branch(BranchId::from_string(s))
        }
    }
}

impl From<ParentRef> for String {
    fn from(p: ParentRef) -> Self {
        match p {
            ParentRef::Root => ROOT_PARENT.to_string(),
            ParentRef::Branch(id) => id.into_inner(),
        }
    }
}

impl From<BranchId> for ParentRef {
    fn from(id: BranchId) -> Self {
        Self::Branch(id)
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str(ROOT_PARENT),
            Self::Branch(id) => f.write_str(id.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(BranchId::new().as_str().starts_with("br_"));
        assert!(ConversationId::new().as_str().starts_with("conv_"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = BranchId::new();
        let b = BranchId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn branch_id_serializes_transparently() {
        let id = BranchId::from("br_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"br_abc\"");
    }

    #[test]
    fn parent_ref_root_round_trips_as_literal() {
        let json = serde_json::to_string(&ParentRef::Root).unwrap();
        assert_eq!(json, "\"root\"");
        let back: ParentRef = serde_json::from_str(&json).unwrap();
        assert!(back.is_root());
    }

    #[test]
    fn parent_ref_branch_parses_from_string() {
        let p: ParentRef = serde_json::from_str("\"br_1\"").unwrap();
        assert_eq!(p.branch().map(BranchId::as_str), Some("br_1"));
        assert_eq!(p.to_string(), "br_1");
    }
}
