//! Channel names and the upstream topics that carry them

use std::fmt;

const WORKSPACE_PREFIX: &str = "workspace:";
const CONVERSATION_PREFIX: &str = "conversation:";

/// Pattern subscription covering every conversation channel
pub const CONVERSATION_PATTERN: &str = "conversation:*";

/// Name of a live update channel
///
/// `workspace:{id}` carries follow-up status changes for one workspace,
/// `conversation:{id}` carries message activity for one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn workspace(workspace_id: i64) -> Self {
        Self(format!("{}{}", WORKSPACE_PREFIX, workspace_id))
    }

    pub fn conversation(client_id: i64) -> Self {
        Self(format!("{}{}", CONVERSATION_PREFIX, client_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The upstream subscription that delivers this channel
    ///
    /// All conversations share one pattern subscription; every other channel
    /// is subscribed by exact name.
    pub fn topic(&self) -> Topic {
        if self.0.starts_with(CONVERSATION_PREFIX) {
            Topic::Pattern(CONVERSATION_PATTERN.to_string())
        } else {
            Topic::Exact(self.0.clone())
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An upstream pub/sub subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Glob pattern subscription (`PSUBSCRIBE`)
    Pattern(String),
    /// Exact channel subscription (`SUBSCRIBE`)
    Exact(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pattern(p) | Self::Exact(p) => p,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(p) => write!(f, "pattern {}", p),
            Self::Exact(c) => write!(f, "channel {}", c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn conversations_share_the_pattern_topic() {
        assert_eq!(
            ChannelName::conversation(4).topic(),
            Topic::Pattern("conversation:*".to_string())
        );
        assert_eq!(
            ChannelName::conversation(4).topic(),
            ChannelName::conversation(9).topic()
        );
    }

    #[test]
    fn workspaces_are_exact_topics() {
        let channel = ChannelName::workspace(12);
        assert_eq!(channel.as_str(), "workspace:12");
        assert_eq!(channel.topic(), Topic::Exact("workspace:12".to_string()));
        assert_eq!(
            ChannelName::from("audit").topic(),
            Topic::Exact("audit".to_string())
        );
    }
}
