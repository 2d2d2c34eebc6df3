//! Storage contracts
//!
//! The relational store is an external collaborator. Only the parameter and
//! result shapes of its calls are defined here; signature verification and
//! audit persistence happen on the other side of these traits.

mod memory;

pub use memory::{AuditWrite, MemoryStore, NodeEntry, TokenEntry};

use crate::error::Result;
use chrono::{DateTime, Utc};

/// Parameters of the authenticate call
#[derive(Debug, Clone, Copy)]
pub struct AuthenticateCall<'a> {
    pub token_id: &'a str,
    pub date: DateTime<Utc>,
    pub host: &'a str,
    pub path: &'a str,
    /// Hex encoded request signature
    pub signature: &'a str,
}

/// Row returned by a successful authenticate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRow {
    pub user_id: i64,
    pub token_type: String,
    /// Policy JSON, if the token carries one
    pub policy: Option<String>,
}

/// Row returned by the authorize-by-token and authorize-by-node calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorRow {
    pub user_id: Option<i64>,
    /// Absent for node rows
    pub token_type: Option<String>,
    pub policy: Option<String>,
    /// Node ids the owner has access to
    pub node_ids: Vec<i64>,
}

/// Token verification and actor lookups
pub trait AuthStore: Send + Sync {
    /// Verify a signed request; returns the token when the signature matches
    fn authenticate(&self, call: &AuthenticateCall<'_>) -> Result<Option<TokenRow>>;

    fn actor_by_token(&self, token_id: &str) -> Result<Option<ActorRow>>;

    fn actor_by_node(&self, node_id: i64) -> Result<Option<ActorRow>>;
}

/// One audit delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditRecord<'a> {
    pub service: &'a str,
    pub object_id: i64,
    pub source_id: Option<&'a str>,
    pub bucket: DateTime<Utc>,
    /// Bytes to add to the stored total
    pub count: u64,
}

/// Source of audit write connections
pub trait AuditStore: Send + Sync {
    fn connect(&self) -> Result<Box<dyn AuditConnection>>;
}

/// A live audit write connection, owned by the writer thread
pub trait AuditConnection: Send {
    /// Add `record.count` to the stored total for the record's key
    fn increment(&mut self, record: &AuditRecord<'_>) -> Result<()>;
}
