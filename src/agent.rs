//! Webhook auth agent
//!
//! Wires the authentication gateway, authorization engine, actor repository
//! and audit aggregator behind the broker's webhook callbacks.

use crate::acl::{AuthorizationEngine, EngineSettings};
use crate::actor::{Actor, ActorRepository};
use crate::audit::{AuditAggregator, AuditSettings};
use crate::auth::{AuthenticationGateway, GatewaySettings, Snws2Signer};
use crate::clock::{Clock, SystemClock};
use crate::config::FluxAuthConfig;
use crate::error::{Error, Result as StoreResult};
use crate::mqtt::Message;
use crate::store::{AuditStore, AuthStore};
use crate::webhook::{
    DeliverRequest, HookResponse, Modifiers, PublishRequest, RegisterRequest, SubscribeRequest,
    WebhookRequest,
};

use anyhow::Result;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Webhook auth agent
pub struct FluxAuthAgent {
    /// Configuration
    config: Arc<RwLock<FluxAuthConfig>>,
    /// Connection authentication
    gateway: Arc<AuthenticationGateway>,
    /// Topic authorization
    engine: Arc<AuthorizationEngine>,
    /// Cached actor lookups
    repository: Arc<ActorRepository>,
    /// Usage auditing
    audit: Arc<AuditAggregator>,
}

impl FluxAuthAgent {
    /// Create an agent over one store serving both lookups and audit writes
    pub fn with_config<S>(config: FluxAuthConfig, store: Arc<S>) -> Result<Self>
    where
        S: AuthStore + AuditStore + 'static,
    {
        Self::with_parts(config, store.clone(), store, Arc::new(SystemClock))
    }

    /// Create an agent from its collaborators
    ///
    /// The audit writer is started when auditing is enabled.
    pub fn with_parts(
        config: FluxAuthConfig,
        auth_store: Arc<dyn AuthStore>,
        audit_store: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let repository = Arc::new(ActorRepository::with_config(
            Arc::clone(&auth_store),
            &config.cache,
        ));
        let gateway = AuthenticationGateway::with_parts(
            &config.auth,
            Arc::clone(&repository),
            auth_store,
            Arc::new(Snws2Signer::new()),
            Arc::clone(&clock),
        )?;
        let engine = AuthorizationEngine::with_clock(&config.authz, Arc::clone(&clock))?;
        let audit = AuditAggregator::with_clock(&config.audit, audit_store, clock)?;

        if config.audit.enabled {
            audit.enable()?;
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            gateway: Arc::new(gateway),
            engine: Arc::new(engine),
            repository,
            audit: Arc::new(audit),
        })
    }

    /// Reconfigure the agent
    ///
    /// Nothing changes unless every section is valid. Cache settings only
    /// apply to agents created afterwards.
    pub fn reconfigure(&self, config: FluxAuthConfig) -> Result<()> {
        let auth = GatewaySettings::from_config(&config.auth)?;
        let authz = EngineSettings::from_config(&config.authz)?;
        let audit = AuditSettings::from_config(&config.audit)?;

        self.gateway.apply(auth);
        self.engine.apply(authz);
        self.audit.apply(audit);

        let previous = self.config.read().audit.clone();
        if config.audit.enabled && !previous.enabled {
            self.audit.enable()?;
        } else if !config.audit.enabled && previous.enabled {
            self.audit.disable();
        } else if previous.write_settings_differ(&config.audit) {
            info!("Audit write settings changed, reconnecting writer");
            self.audit.force_reconnect();
        }

        *self.config.write() = config;
        Ok(())
    }

    /// Dispatch a webhook request
    pub fn handle(&self, request: &WebhookRequest) -> HookResponse {
        match request {
            WebhookRequest::AuthOnRegister(register) => self.on_register(register),
            WebhookRequest::AuthOnPublish(publish) => self.on_publish(publish),
            WebhookRequest::AuthOnSubscribe(subscribe) => self.on_subscribe(subscribe),
            WebhookRequest::OnDeliver(deliver) => self.on_deliver(deliver),
        }
    }

    /// Handle a client connecting
    pub fn on_register(&self, request: &RegisterRequest) -> HookResponse {
        info!(
            client_id = %request.client_id,
            username = ?request.username,
            peer_addr = ?request.peer_addr,
            "MQTT REGISTER"
        );

        match self.gateway.authenticate(request) {
            Ok(response) => {
                if !response.is_allowed() {
                    info!(client_id = %request.client_id, "REGISTER not authenticated");
                }
                response
            }
            Err(e) => store_failure("register", &request.client_id, e),
        }
    }

    /// Handle a client publishing
    pub fn on_publish(&self, request: &PublishRequest) -> HookResponse {
        debug!(
            client_id = %request.client_id,
            topic = %request.topic,
            qos = %request.qos,
            retain = request.retain,
            size = request.payload.len(),
            "MQTT PUBLISH"
        );

        let actor = match self.resolve_actor(request.username.as_deref(), &request.client_id) {
            Ok(Some(actor)) => actor,
            Ok(None) => {
                debug!(client_id = %request.client_id, "PUBLISH without actor");
                return HookResponse::Next;
            }
            Err(e) => return store_failure("publish", &request.client_id, e),
        };

        let message = request.message();
        let Some(routed) = self.engine.evaluate_publish(&actor, &message) else {
            info!(
                client_id = %request.client_id,
                topic = %request.topic,
                "PUBLISH denied"
            );
            return HookResponse::Next;
        };

        self.record_publish(&actor, &routed);

        match routed {
            Cow::Borrowed(_) => HookResponse::Ok,
            Cow::Owned(routed) => {
                HookResponse::with_modifiers(Modifiers::for_route(&message, &routed))
            }
        }
    }

    /// Handle a client subscribing
    pub fn on_subscribe(&self, request: &SubscribeRequest) -> HookResponse {
        debug!(
            client_id = %request.client_id,
            topics = ?request.topics.iter().map(|s| &s.topic).collect::<Vec<_>>(),
            "MQTT SUBSCRIBE"
        );

        let actor = match self.resolve_actor(request.username.as_deref(), &request.client_id) {
            Ok(Some(actor)) => actor,
            Ok(None) => {
                debug!(client_id = %request.client_id, "SUBSCRIBE without actor");
                return HookResponse::Next;
            }
            Err(e) => return store_failure("subscribe", &request.client_id, e),
        };

        match self.engine.evaluate_subscribe(&actor, &request.topics) {
            Cow::Borrowed(_) => HookResponse::Ok,
            Cow::Owned(topics) => HookResponse::Topics(topics),
        }
    }

    /// Handle a message being delivered; only audited
    pub fn on_deliver(&self, request: &DeliverRequest) -> HookResponse {
        self.audit.record_deliver(&request.message());
        HookResponse::Ok
    }

    /// Stop the audit writer, waiting up to `timeout` for its final drain
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.audit.shutdown(timeout)
    }

    pub fn audit(&self) -> &AuditAggregator {
        &self.audit
    }

    pub fn repository(&self) -> &ActorRepository {
        &self.repository
    }

    /// Get the current configuration
    pub fn config(&self) -> FluxAuthConfig {
        self.config.read().clone()
    }

    fn resolve_actor(
        &self,
        username: Option<&str>,
        client_id: &str,
    ) -> StoreResult<Option<Arc<Actor>>> {
        let Some(username) = username else {
            return Ok(None);
        };
        if self.gateway.is_device_username(username) {
            match client_id.parse::<i64>() {
                Ok(node_id) => self.repository.actor_by_node(node_id),
                Err(_) => Ok(None),
            }
        } else {
            self.repository.actor_by_token(username)
        }
    }

    /// Count an allowed publish against its node and source, or against the
    /// actor's user when the topic carries no source
    fn record_publish(&self, actor: &Actor, message: &Message) {
        match (actor.node_id(), self.engine.source_id_for_publish(message)) {
            (Some(node_id), Some(source_id)) => {
                self.audit.record_publish(node_id, Some(&source_id), message)
            }
            _ => match actor.user_id() {
                Some(user_id) => self.audit.record_publish(user_id, None, message),
                None => debug!(topic = %message.topic, "Publish not audited"),
            },
        }
    }
}

fn store_failure(hook: &str, client_id: &str, error: Error) -> HookResponse {
    warn!(hook = %hook, client_id = %client_id, error = %error, "Store failure");
    HookResponse::error(error.to_string())
}
