//! Webhook auth core for the SolarFlux MQTT broker
//!
//! The broker delegates every connect, publish and subscribe decision to this
//! crate, and reports delivered messages for metering:
//!
//! - **Authentication**: device clients by node id and peer address, token
//!   clients by a signed date verified by the store
//! - **Authorization**: node datum topics checked against the actor's nodes and
//!   security policy; per-filter partial grants on subscribe; optional
//!   `user/{id}/` topic prefixes and QoS downgrade
//! - **Auditing**: payload bytes coalesced per node, source and hour in memory
//!   and persisted as deltas by a background writer
//!
//! # Architecture
//!
//! [`FluxAuthAgent`] answers [`webhook::WebhookRequest`]s. Actor lookups go
//! through a cache-aside [`actor::ActorRepository`]; storage is reached
//! through the [`store::AuthStore`] and [`store::AuditStore`] traits.
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "auth": {
//!     "device-username": "solarnode",
//!     "ip-mask": "10.0.0.0/8",
//!     "max-date-skew-secs": 900
//!   },
//!   "authz": {
//!     "allow-topic-prefix": true,
//!     "max-qos": 1
//!   },
//!   "audit": {
//!     "publish-service": "flxi",
//!     "deliver-service": "flxo",
//!     "flush-delay-ms": 10000
//!   },
//!   "cache": { "ttl-secs": 300 }
//! }
//! ```

pub mod acl;
pub mod actor;
pub mod agent;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod qos;
pub mod store;
pub mod webhook;

// Re-export main types
pub use acl::AuthorizationEngine;
pub use actor::{Actor, ActorRepository, ActorType};
pub use agent::FluxAuthAgent;
pub use audit::AuditAggregator;
pub use auth::AuthenticationGateway;
pub use config::FluxAuthConfig;
pub use error::{Error, Result};
pub use webhook::{HookResponse, WebhookRequest};
