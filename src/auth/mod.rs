//! Connection authentication
//!
//! Two paths, chosen by username:
//!
//! * device clients (the configured device username) are already
//!   authenticated by the transport; only the peer address and node identity
//!   are checked
//! * everyone else presents a token id as username and a signed date as
//!   password, verified by the store

mod signer;

pub use signer::{RequestSigner, SigningRequest, Snws2Signer, DATE_HEADER};

use crate::actor::{ActorRepository, SecurityPolicy};
use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::error::Result;
use crate::store::{AuthStore, AuthenticateCall};
use crate::webhook::{HookResponse, Modifiers, RegisterRequest};
use anyhow::Context;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::RwLock;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

const DATE_COMPONENT: &str = "Date";
const SIGNATURE_COMPONENT: &str = "Signature";

/// Date and signature carried in a token password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPassword {
    pub date: String,
    pub signature: String,
}

impl SignedPassword {
    /// Parse `Date=<epoch secs>,Signature=<hex>`
    ///
    /// Unknown components are ignored. Returns `None` when either component is
    /// missing or empty.
    pub fn parse(password: &str) -> Option<Self> {
        let mut date = None;
        let mut signature = None;
        for component in password.split(',') {
            let Some((key, value)) = component.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                DATE_COMPONENT => date = Some(value),
                SIGNATURE_COMPONENT => signature = Some(value),
                _ => {}
            }
        }

        match (date, signature) {
            (Some(date), Some(signature)) if !date.is_empty() && !signature.is_empty() => {
                Some(Self {
                    date: date.to_string(),
                    signature: signature.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Encode in the same form [`parse`](Self::parse) reads
    pub fn encode(&self) -> String {
        format!(
            "{}={},{}={}",
            DATE_COMPONENT, self.date, SIGNATURE_COMPONENT, self.signature
        )
    }
}

/// Compiled authentication settings
pub struct GatewaySettings {
    device_username: String,
    ip_mask: Option<IpNet>,
    max_date_skew_secs: i64,
    require_token_client_id_prefix: bool,
    force_clean_session: bool,
    direct_token_secret: Option<Regex>,
    host: String,
    path: String,
}

impl GatewaySettings {
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let ip_mask = config
            .ip_mask
            .as_deref()
            .map(|mask| {
                mask.parse::<IpNet>()
                    .with_context(|| format!("Invalid ip-mask: {}", mask))
            })
            .transpose()?;

        let direct_token_secret = if config.direct_token_authentication {
            Some(Regex::new(&config.direct_token_secret_regex).with_context(|| {
                format!(
                    "Invalid direct-token-secret-regex: {}",
                    config.direct_token_secret_regex
                )
            })?)
        } else {
            None
        };

        Ok(Self {
            device_username: config.device_username.clone(),
            ip_mask,
            max_date_skew_secs: config.max_date_skew_secs,
            require_token_client_id_prefix: config.require_token_client_id_prefix,
            force_clean_session: config.force_clean_session,
            direct_token_secret,
            host: config.host.clone(),
            path: config.path.clone(),
        })
    }

    fn allowed(&self, request: &RegisterRequest) -> HookResponse {
        if self.force_clean_session && !request.clean_session {
            HookResponse::Modifiers(Modifiers::clean_session())
        } else {
            HookResponse::Ok
        }
    }

    fn peer_allowed(&self, peer_addr: Option<&str>) -> bool {
        let Some(mask) = self.ip_mask else {
            return true;
        };
        peer_addr
            .and_then(|addr| addr.parse::<IpAddr>().ok())
            .map_or(false, |addr| mask.contains(&addr))
    }
}

/// Authentication gateway - validates client credentials on connect
pub struct AuthenticationGateway {
    settings: RwLock<GatewaySettings>,
    repository: Arc<ActorRepository>,
    store: Arc<dyn AuthStore>,
    signer: Arc<dyn RequestSigner>,
    clock: Arc<dyn Clock>,
}

impl AuthenticationGateway {
    /// Create a new gateway from configuration
    pub fn new(
        config: &AuthConfig,
        repository: Arc<ActorRepository>,
        store: Arc<dyn AuthStore>,
    ) -> anyhow::Result<Self> {
        Self::with_parts(
            config,
            repository,
            store,
            Arc::new(Snws2Signer::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: &AuthConfig,
        repository: Arc<ActorRepository>,
        store: Arc<dyn AuthStore>,
        signer: Arc<dyn RequestSigner>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            settings: RwLock::new(GatewaySettings::from_config(config)?),
            repository,
            store,
            signer,
            clock,
        })
    }

    /// Reconfigure with new settings
    pub fn reconfigure(&self, config: &AuthConfig) -> anyhow::Result<()> {
        self.apply(GatewaySettings::from_config(config)?);
        Ok(())
    }

    /// Swap in settings compiled with [`GatewaySettings::from_config`]
    pub fn apply(&self, settings: GatewaySettings) {
        *self.settings.write() = settings;
    }

    /// Whether `username` identifies a device client
    pub fn is_device_username(&self, username: &str) -> bool {
        username.eq_ignore_ascii_case(&self.settings.read().device_username)
    }

    /// Authenticate a connecting client
    ///
    /// Denials resolve to [`HookResponse::Next`]; a malformed date resolves to
    /// [`HookResponse::Error`]. Store failures are returned as errors.
    pub fn authenticate(&self, request: &RegisterRequest) -> Result<HookResponse> {
        let settings = self.settings.read();
        let Some(username) = request.username.as_deref() else {
            debug!(client_id = %request.client_id, "No username");
            return Ok(HookResponse::Next);
        };

        if username.eq_ignore_ascii_case(&settings.device_username) {
            self.authenticate_device(&settings, request)
        } else {
            self.authenticate_token(&settings, username, request)
        }
    }

    fn authenticate_device(
        &self,
        settings: &GatewaySettings,
        request: &RegisterRequest,
    ) -> Result<HookResponse> {
        if !settings.peer_allowed(request.peer_addr.as_deref()) {
            debug!(
                client_id = %request.client_id,
                peer_addr = ?request.peer_addr,
                "Device peer address not allowed"
            );
            return Ok(HookResponse::Next);
        }

        let Ok(node_id) = request.client_id.parse::<i64>() else {
            debug!(client_id = %request.client_id, "Device client id is not a node id");
            return Ok(HookResponse::Next);
        };

        if self.repository.actor_by_node(node_id)?.is_none() {
            debug!(node_id, "Unknown node");
            return Ok(HookResponse::Next);
        }

        info!(node_id, "Device authenticated");
        Ok(settings.allowed(request))
    }

    fn authenticate_token(
        &self,
        settings: &GatewaySettings,
        token_id: &str,
        request: &RegisterRequest,
    ) -> Result<HookResponse> {
        if settings.require_token_client_id_prefix && !request.client_id.starts_with(token_id) {
            debug!(
                token_id = %token_id,
                client_id = %request.client_id,
                "Client id not prefixed by token id"
            );
            return Ok(HookResponse::Next);
        }

        let now = self.clock.now();
        let password = request.password.as_deref().unwrap_or_default();
        let signed = match &settings.direct_token_secret {
            Some(pattern) if pattern.is_match(password) => {
                Some(self.sign_direct(settings, token_id, password, now))
            }
            _ => SignedPassword::parse(password),
        };
        let Some(signed) = signed else {
            debug!(token_id = %token_id, "Password missing date or signature");
            return Ok(HookResponse::Next);
        };

        let Some(date) = signed
            .date
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        else {
            debug!(token_id = %token_id, date = %signed.date, "Malformed password date");
            return Ok(HookResponse::error(format!(
                "Invalid {} component: {}",
                DATE_COMPONENT, signed.date
            )));
        };

        if settings.max_date_skew_secs >= 0 {
            let skew = (now - date).num_seconds().abs();
            if skew > settings.max_date_skew_secs {
                debug!(token_id = %token_id, skew, "Password date skew too large");
                return Ok(HookResponse::Next);
            }
        }

        let call = AuthenticateCall {
            token_id,
            date,
            host: &settings.host,
            path: &settings.path,
            signature: &signed.signature,
        };
        let Some(row) = self.store.authenticate(&call)? else {
            debug!(token_id = %token_id, "Token signature not verified");
            return Ok(HookResponse::Next);
        };

        if let Some(policy) = row.policy.as_deref() {
            let policy = SecurityPolicy::from_json(policy)?;
            if !policy.valid_at(now) {
                debug!(token_id = %token_id, "Token policy expired");
                return Ok(HookResponse::Next);
            }
        }

        info!(
            token_id = %token_id,
            user_id = row.user_id,
            token_type = %row.token_type,
            "Token authenticated"
        );
        Ok(settings.allowed(request))
    }

    /// Sign a raw token secret as the client would have
    fn sign_direct(
        &self,
        settings: &GatewaySettings,
        token_id: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> SignedPassword {
        // signed dates carry whole seconds
        let date = DateTime::<Utc>::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        let signature = self.signer.sign(&SigningRequest {
            token_id,
            secret,
            host: &settings.host,
            path: &settings.path,
            date,
        });
        SignedPassword {
            date: date.timestamp().to_string(),
            signature,
        }
    }
}
