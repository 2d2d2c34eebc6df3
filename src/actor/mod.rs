//! Actors: the identity and capabilities resolved for a connection

mod policy;
mod repository;

pub use policy::{Aggregation, SecurityPolicy, SourcePatterns};
pub use repository::{ActorCache, ActorRepository, MokaActorCache};

use crate::error::{Error, Result};
use crate::store::ActorRow;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Kind of actor behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorType {
    /// A device connecting with its own node identity
    Node,
    /// A user security token
    UserToken,
    /// A read-only node data token
    DataToken,
}

impl ActorType {
    /// Token type name as stored with the token
    pub fn token_type_name(self) -> Option<&'static str> {
        match self {
            Self::Node => None,
            Self::UserToken => Some("User"),
            Self::DataToken => Some("ReadNodeData"),
        }
    }
}

impl FromStr for ActorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "User" => Ok(Self::UserToken),
            "ReadNodeData" => Ok(Self::DataToken),
            other => Err(Error::UnknownTokenType(other.to_string())),
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => f.write_str("Node"),
            Self::UserToken => f.write_str("UserToken"),
            Self::DataToken => f.write_str("DataToken"),
        }
    }
}

/// Identity plus capability policy for one connection
///
/// Built once per lookup and never mutated afterwards; the repository shares
/// it as `Arc<Actor>` between cache and callers.
#[derive(Debug, Clone)]
pub struct Actor {
    token_id: Option<String>,
    actor_type: ActorType,
    user_id: Option<i64>,
    policy: Option<SecurityPolicy>,
    allowed_node_ids: BTreeSet<i64>,
    source_patterns: Option<SourcePatterns>,
}

impl Actor {
    /// Create an actor for a token
    ///
    /// `owned_node_ids` are the nodes the token owner has access to; they only
    /// apply when the policy does not restrict node ids itself.
    pub fn token(
        token_id: impl Into<String>,
        actor_type: ActorType,
        user_id: Option<i64>,
        policy: Option<SecurityPolicy>,
        owned_node_ids: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self::build(Some(token_id.into()), actor_type, user_id, policy, owned_node_ids)
    }

    /// Create an actor for a node
    pub fn node(node_id: i64, user_id: Option<i64>) -> Self {
        Self::build(None, ActorType::Node, user_id, None, [node_id])
    }

    fn build(
        token_id: Option<String>,
        actor_type: ActorType,
        user_id: Option<i64>,
        policy: Option<SecurityPolicy>,
        owned_node_ids: impl IntoIterator<Item = i64>,
    ) -> Self {
        let allowed_node_ids = match policy.as_ref() {
            Some(p) if p.restricts_nodes() => p.node_ids.clone(),
            _ => owned_node_ids.into_iter().collect(),
        };
        let source_patterns = policy
            .as_ref()
            .filter(|p| p.restricts_sources())
            .map(|p| SourcePatterns::compile(&p.source_ids));

        Self {
            token_id,
            actor_type,
            user_id,
            policy,
            allowed_node_ids,
            source_patterns,
        }
    }

    pub fn token_id(&self) -> Option<&str> {
        self.token_id.as_deref()
    }

    pub fn actor_type(&self) -> ActorType {
        self.actor_type
    }

    /// Only node actors may publish
    pub fn is_publish_allowed(&self) -> bool {
        self.actor_type == ActorType::Node
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    pub fn policy(&self) -> Option<&SecurityPolicy> {
        self.policy.as_ref()
    }

    pub fn allowed_node_ids(&self) -> &BTreeSet<i64> {
        &self.allowed_node_ids
    }

    /// Node id of a node actor
    pub fn node_id(&self) -> Option<i64> {
        match self.actor_type {
            ActorType::Node => self.allowed_node_ids.iter().next().copied(),
            _ => None,
        }
    }

    /// Compiled source patterns, when the policy restricts sources
    pub fn source_patterns(&self) -> Option<&SourcePatterns> {
        self.source_patterns.as_ref()
    }

    /// Whether the policy (if any) is still valid at `now`
    pub fn policy_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.policy.as_ref().map_or(true, |p| p.valid_at(now))
    }

    /// Whether the policy (if any) restricts node ids
    pub fn restricts_nodes(&self) -> bool {
        self.policy.as_ref().map_or(false, |p| p.restricts_nodes())
    }
}

/// Map an authorize-by-token row to an actor
pub fn actor_from_token_row(token_id: &str, row: ActorRow) -> Result<Actor> {
    let token_type = row.token_type.ok_or(Error::IncompleteRow("token_type"))?;
    let actor_type: ActorType = token_type.parse()?;
    let policy = row
        .policy
        .as_deref()
        .map(SecurityPolicy::from_json)
        .transpose()?;

    Ok(Actor::token(
        token_id,
        actor_type,
        row.user_id,
        policy,
        row.node_ids,
    ))
}

/// Map an authorize-by-node row to an actor
pub fn actor_from_node_row(node_id: i64, row: ActorRow) -> Actor {
    Actor::node(node_id, row.user_id)
}
