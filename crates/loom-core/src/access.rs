//! Collaboration permission tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Permission granted to a collaborator through an invite.
///
/// Ordered: `Viewer < Collaborator < Editor`. The conversation owner sits
/// above every tier and is not represented here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read-only access.
    Viewer,
    /// May add messages, branches, bookmarks and stream generations.
    Collaborator,
    /// Collaborator rights plus delete, split and restore.
    Editor,
}

impl Permission {
    /// Wire string for this permission.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Collaborator => "collaborator",
            Self::Editor => "editor",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored permission string is not recognised.
#[derive(Debug, Error)]
#[error("unknown permission: {0}")]
pub struct PermissionParseError(pub String);

impl FromStr for Permission {
    type Err = PermissionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "collaborator" => Ok(Self::Collaborator),
            "editor" => Ok(Self::Editor),
            other => Err(PermissionParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(Permission::Viewer < Permission::Collaborator);
        assert!(Permission::Collaborator < Permission::Editor);
    }

    #[test]
    fn parse_round_trip() {
        for p in [
            Permission::Viewer,
            Permission::Collaborator,
            Permission::Editor,
        ] {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
    }

    #[test]
    fn parse_unknown_fails() {
        let err = "admin".parse::<Permission>().unwrap_err();
        assert_eq!(err.to_string(), "unknown permission: admin");
    }
}
