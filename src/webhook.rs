//! Webhook request and response types
//!
//! Requests arrive as JSON objects tagged with the broker hook name. Payloads
//! travel base64 encoded.

use crate::mqtt::{Message, Qos, TopicSettings};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A broker callback
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum WebhookRequest {
    AuthOnRegister(RegisterRequest),
    AuthOnPublish(PublishRequest),
    AuthOnSubscribe(SubscribeRequest),
    OnDeliver(DeliverRequest),
}

impl WebhookRequest {
    pub fn hook_name(&self) -> &'static str {
        match self {
            Self::AuthOnRegister(_) => "auth_on_register",
            Self::AuthOnPublish(_) => "auth_on_publish",
            Self::AuthOnSubscribe(_) => "auth_on_subscribe",
            Self::OnDeliver(_) => "on_deliver",
        }
    }
}

/// A client connecting
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub client_id: String,
    #[serde(default)]
    pub peer_addr: Option<String>,
    #[serde(default)]
    pub clean_session: bool,
}

/// A client publishing a message
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub username: Option<String>,
    pub client_id: String,
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
    #[serde(default, deserialize_with = "decode_payload")]
    pub payload: Vec<u8>,
}

impl PublishRequest {
    pub fn message(&self) -> Message {
        Message::new(self.topic.clone(), self.qos, self.retain, self.payload.clone())
    }
}

/// A client subscribing to topic filters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub username: Option<String>,
    pub client_id: String,
    pub topics: TopicSettings,
}

/// A message being delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeliverRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
    #[serde(default, deserialize_with = "decode_payload")]
    pub payload: Vec<u8>,
}

impl DeliverRequest {
    pub fn message(&self) -> Message {
        Message::new(self.topic.clone(), self.qos, self.retain, self.payload.clone())
    }
}

fn default_qos() -> Qos {
    Qos::AtMostOnce
}

fn decode_payload<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        Some(s) => BASE64.decode(s).map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

/// Changes the broker should apply to an allowed request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Modifiers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<Qos>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_session: Option<bool>,
}

impl Modifiers {
    /// Force a clean session
    pub fn clean_session() -> Self {
        Self {
            clean_session: Some(true),
            ..Default::default()
        }
    }

    /// Differences between a published message and its routed copy
    pub fn for_route(original: &Message, routed: &Message) -> Self {
        Self {
            topic: (routed.topic != original.topic).then(|| routed.topic.clone()),
            qos: (routed.qos != original.qos).then_some(routed.qos),
            clean_session: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topic.is_none() && self.qos.is_none() && self.clean_session.is_none()
    }
}

/// Answer to a broker callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResponse {
    /// Allowed as requested
    Ok,
    /// Allowed with changes
    Modifiers(Modifiers),
    /// Subscription allowed with a rewritten filter list
    Topics(TopicSettings),
    /// No opinion; the broker consults the next hook
    Next,
    /// The request was malformed
    Error(String),
}

impl HookResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// `Ok` when there is nothing to modify
    pub fn with_modifiers(modifiers: Modifiers) -> Self {
        if modifiers.is_empty() {
            Self::Ok
        } else {
            Self::Modifiers(modifiers)
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Ok | Self::Modifiers(_) | Self::Topics(_))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireResult<'a> {
    Status(&'static str),
    Error { error: &'a str },
}

#[derive(Serialize)]
struct WireResponse<'a> {
    result: WireResult<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modifiers: Option<&'a Modifiers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topics: Option<&'a TopicSettings>,
}

impl Serialize for HookResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Ok => WireResponse {
                result: WireResult::Status("ok"),
                modifiers: None,
                topics: None,
            },
            Self::Modifiers(modifiers) => WireResponse {
                result: WireResult::Status("ok"),
                modifiers: Some(modifiers),
                topics: None,
            },
            Self::Topics(topics) => WireResponse {
                result: WireResult::Status("ok"),
                modifiers: None,
                topics: Some(topics),
            },
            Self::Next => WireResponse {
                result: WireResult::Status("next"),
                modifiers: None,
                topics: None,
            },
            Self::Error(error) => WireResponse {
                result: WireResult::Error { error },
                modifiers: None,
                topics: None,
            },
        };
        wire.serialize(serializer)
    }
}
