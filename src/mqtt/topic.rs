//! Topic grammars
//!
//! Two grammars are recognised, both configurable as regular expressions with
//! named capture groups:
//!
//! * node datum topics: `(user/{userId}/)?node/{nodeId|+}/datum/{aggregation}/{sourceId}`
//!   using groups `userId`, `nodeId`, `aggregation` and `sourceId`
//! * generic user topics: `(user/{userId}/)?{anything}` using groups `userId`
//!   and `topic`

use anyhow::{Context, Result};
use regex::Regex;

/// Default node datum topic pattern
pub const DEFAULT_NODE_DATUM_TOPIC_REGEX: &str =
    r"^(?:user/(?P<userId>\d+)/)?node/(?P<nodeId>\d+|\+)/datum/(?P<aggregation>[^/]+)/(?P<sourceId>.+)$";

/// Default generic user topic pattern
pub const DEFAULT_USER_TOPIC_REGEX: &str = r"^(?:user/(?P<userId>\d+)/)?(?P<topic>.+)$";

/// Prefix added to topics in topic-prefix mode
pub const USER_TOPIC_PREFIX: &str = "user/";

/// Node wildcard accepted in place of a node id
pub const NODE_WILDCARD: &str = "+";

/// Components of a topic matching the node datum grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDatumTopic<'a> {
    pub user_id: Option<&'a str>,
    pub node_id: &'a str,
    pub aggregation: &'a str,
    pub source_id: &'a str,
}

/// Components of a topic matching the generic user grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTopic<'a> {
    pub user_id: Option<&'a str>,
    pub topic: &'a str,
}

/// Compiled topic grammars
#[derive(Debug, Clone)]
pub struct TopicGrammar {
    node_datum: Regex,
    user: Regex,
}

impl TopicGrammar {
    /// Compile grammars from patterns
    pub fn new(node_datum_pattern: &str, user_pattern: &str) -> Result<Self> {
        let node_datum = Regex::new(node_datum_pattern)
            .with_context(|| format!("Invalid node datum topic regex: {}", node_datum_pattern))?;
        for group in ["nodeId", "aggregation", "sourceId"] {
            if !node_datum.capture_names().flatten().any(|n| n == group) {
                anyhow::bail!("Node datum topic regex is missing the `{}` group", group);
            }
        }

        let user = Regex::new(user_pattern)
            .with_context(|| format!("Invalid user topic regex: {}", user_pattern))?;

        Ok(Self { node_datum, user })
    }

    /// Parse a topic against the node datum grammar
    pub fn parse_node_datum<'a>(&self, topic: &'a str) -> Option<NodeDatumTopic<'a>> {
        let caps = self.node_datum.captures(topic)?;
        Some(NodeDatumTopic {
            user_id: caps.name("userId").map(|m| m.as_str()),
            node_id: caps.name("nodeId")?.as_str(),
            aggregation: caps.name("aggregation")?.as_str(),
            source_id: caps.name("sourceId")?.as_str(),
        })
    }

    /// Parse a topic against the generic user grammar
    pub fn parse_user<'a>(&self, topic: &'a str) -> Option<UserTopic<'a>> {
        let caps = self.user.captures(topic)?;
        Some(UserTopic {
            user_id: caps.name("userId").map(|m| m.as_str()),
            topic: caps.name("topic").map(|m| m.as_str()).unwrap_or(topic),
        })
    }
}

impl Default for TopicGrammar {
    fn default() -> Self {
        // The built-in patterns are known to compile and carry every group
        Self {
            node_datum: Regex::new(DEFAULT_NODE_DATUM_TOPIC_REGEX).expect("valid default regex"),
            user: Regex::new(DEFAULT_USER_TOPIC_REGEX).expect("valid default regex"),
        }
    }
}

/// Prefix `topic` with `user/{user_id}/`
pub fn user_prefixed(user_id: i64, topic: &str) -> String {
    format!("{}{}/{}", USER_TOPIC_PREFIX, user_id, topic)
}
