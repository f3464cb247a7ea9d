//! Conversation format discriminator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a conversation is presented to the model.
///
/// - `Standard`: alternating user/assistant chat.
/// - `Prefill`: multi-participant transcript the model continues as one of
///   the named participants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationFormat {
    /// Alternating user/assistant chat.
    #[default]
    Standard,
    /// Participant transcript continued by the model.
    Prefill,
}

impl ConversationFormat {
    /// Wire string for this format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Prefill => "prefill",
        }
    }
}

impl fmt::Display for ConversationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "prefill" => Ok(Self::Prefill),
            other => Err(format!("unknown conversation format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_standard() {
        assert_eq!(ConversationFormat::default(), ConversationFormat::Standard);
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(
            "prefill".parse::<ConversationFormat>().unwrap(),
            ConversationFormat::Prefill
        );
        assert_eq!(ConversationFormat::Standard.to_string(), "standard");
        assert!("chat".parse::<ConversationFormat>().is_err());
    }
}
