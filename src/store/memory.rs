//! In-process store
//!
//! Keeps tokens, nodes and audit totals in memory. Used by the CLI with a JSON
//! fixtures file and by tests, which can also inject failures.

use super::{
    ActorRow, AuditConnection, AuditRecord, AuditStore, AuthStore, AuthenticateCall, TokenRow,
};
use crate::auth::{RequestSigner, SigningRequest, Snws2Signer};
use crate::error::{Error, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Token entry in a fixtures file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenEntry {
    pub secret: String,
    pub user_id: i64,
    /// `User` or `ReadNodeData`
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Policy JSON document
    #[serde(default, deserialize_with = "policy_document")]
    pub policy: Option<String>,
    /// Nodes the token owner can access
    #[serde(default)]
    pub node_ids: Vec<i64>,
}

/// Node entry in a fixtures file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeEntry {
    pub user_id: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Fixtures {
    #[serde(default)]
    tokens: HashMap<String, TokenEntry>,
    #[serde(default)]
    nodes: HashMap<i64, NodeEntry>,
}

fn default_token_type() -> String {
    "User".to_string()
}

/// Policies are written inline as JSON objects and kept as their JSON text
fn policy_document<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }))
}

/// A persisted audit delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditWrite {
    pub service: String,
    pub object_id: i64,
    pub source_id: Option<String>,
    pub bucket: DateTime<Utc>,
    pub count: u64,
}

#[derive(Default)]
struct Shared {
    tokens: RwLock<HashMap<String, TokenEntry>>,
    nodes: RwLock<HashMap<i64, NodeEntry>>,
    writes: Mutex<Vec<AuditWrite>>,
    lookups: AtomicUsize,
    connects: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_connects: AtomicUsize,
    fail_writes: AtomicUsize,
}

/// In-memory [`AuthStore`] and [`AuditStore`]
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    signer: Arc<dyn RequestSigner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_signer(Arc::new(Snws2Signer::new()))
    }

    pub fn with_signer(signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            signer,
        }
    }

    /// Load tokens and nodes from a JSON fixtures file
    pub fn from_fixtures_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures file: {}", path.display()))?;
        let fixtures: Fixtures =
            serde_json::from_str(&contents).with_context(|| "Failed to parse fixtures file")?;

        let store = Self::new();
        for (token_id, entry) in fixtures.tokens {
            store.add_token(&token_id, entry);
        }
        for (node_id, entry) in fixtures.nodes {
            store.add_node(node_id, entry);
        }
        Ok(store)
    }

    pub fn add_token(&self, token_id: &str, entry: TokenEntry) {
        self.shared.tokens.write().insert(token_id.to_string(), entry);
    }

    pub fn remove_token(&self, token_id: &str) -> bool {
        self.shared.tokens.write().remove(token_id).is_some()
    }

    pub fn add_node(&self, node_id: i64, entry: NodeEntry) {
        self.shared.nodes.write().insert(node_id, entry);
    }

    /// Number of actor lookups that reached the store
    pub fn lookup_count(&self) -> usize {
        self.shared.lookups.load(Ordering::SeqCst)
    }

    /// Number of audit connections opened
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Make every lookup fail until reset
    pub fn fail_lookups(&self, fail: bool) {
        self.shared.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` audit connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` audit writes
    pub fn fail_next_writes(&self, n: usize) {
        self.shared.fail_writes.store(n, Ordering::SeqCst);
    }

    /// All audit deltas written so far, in order
    pub fn audit_writes(&self) -> Vec<AuditWrite> {
        self.shared.writes.lock().clone()
    }

    /// Sum of the deltas written for a service, object and source
    pub fn audit_total(&self, service: &str, object_id: i64, source_id: Option<&str>) -> u64 {
        self.shared
            .writes
            .lock()
            .iter()
            .filter(|w| {
                w.service == service && w.object_id == object_id && w.source_id.as_deref() == source_id
            })
            .map(|w| w.count)
            .sum()
    }

    fn check_lookup(&self) -> Result<()> {
        self.shared.lookups.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::Query("lookup failure injected".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume one unit of an injected failure budget
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl AuthStore for MemoryStore {
    fn authenticate(&self, call: &AuthenticateCall<'_>) -> Result<Option<TokenRow>> {
        if self.shared.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::Query("authenticate failure injected".to_string()));
        }

        let tokens = self.shared.tokens.read();
        let Some(entry) = tokens.get(call.token_id) else {
            return Ok(None);
        };

        let expected = self.signer.sign(&SigningRequest {
            token_id: call.token_id,
            secret: &entry.secret,
            host: call.host,
            path: call.path,
            date: call.date,
        });
        if !expected.eq_ignore_ascii_case(call.signature) {
            return Ok(None);
        }

        Ok(Some(TokenRow {
            user_id: entry.user_id,
            token_type: entry.token_type.clone(),
            policy: entry.policy.clone(),
        }))
    }

    fn actor_by_token(&self, token_id: &str) -> Result<Option<ActorRow>> {
        self.check_lookup()?;
        Ok(self.shared.tokens.read().get(token_id).map(|entry| ActorRow {
            user_id: Some(entry.user_id),
            token_type: Some(entry.token_type.clone()),
            policy: entry.policy.clone(),
            node_ids: entry.node_ids.clone(),
        }))
    }

    fn actor_by_node(&self, node_id: i64) -> Result<Option<ActorRow>> {
        self.check_lookup()?;
        Ok(self.shared.nodes.read().get(&node_id).map(|entry| ActorRow {
            user_id: Some(entry.user_id),
            token_type: None,
            policy: None,
            node_ids: vec![node_id],
        }))
    }
}

impl AuditStore for MemoryStore {
    fn connect(&self) -> Result<Box<dyn AuditConnection>> {
        if take_failure(&self.shared.fail_connects) {
            return Err(Error::StoreUnavailable("connect failure injected".to_string()));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryAuditConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryAuditConnection {
    shared: Arc<Shared>,
}

impl AuditConnection for MemoryAuditConnection {
    fn increment(&mut self, record: &AuditRecord<'_>) -> Result<()> {
        if take_failure(&self.shared.fail_writes) {
            return Err(Error::Query("write failure injected".to_string()));
        }
        self.shared.writes.lock().push(AuditWrite {
            service: record.service.to_string(),
            object_id: record.object_id,
            source_id: record.source_id.map(str::to_string),
            bucket: record.bucket,
            count: record.count,
        });
        Ok(())
    }
}
