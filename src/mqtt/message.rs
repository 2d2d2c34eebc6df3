//! MQTT message and subscription values exchanged with the broker

use serde::{Deserialize, Serialize};
use std::fmt;

/// MQTT quality of service, plus the SUBACK failure sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    /// Denies a single subscription filter without failing the whole batch
    NotAllowed,
}

impl Qos {
    /// Wire value (0, 1, 2 or 0x80)
    pub fn value(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
            Self::NotAllowed => 0x80,
        }
    }

    /// Lower this QoS to `max` if it is higher. `NotAllowed` is never changed.
    pub fn clamp_to(self, max: Qos) -> Qos {
        if self == Self::NotAllowed || max == Self::NotAllowed {
            return self;
        }
        self.min(max)
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            0x80 => Ok(Self::NotAllowed),
            other => Err(format!("invalid QoS value {}", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos.value()
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// A published or delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    /// Message body; empty when the broker sent none
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, qos: Qos, retain: bool, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain,
            payload,
        }
    }

    /// Copy of this message with a different topic and QoS
    pub fn with_route(&self, topic: String, qos: Qos) -> Self {
        Self {
            topic,
            qos,
            retain: self.retain,
            payload: self.payload.clone(),
        }
    }
}

/// One subscription filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSetting {
    pub topic: String,
    pub qos: Qos,
}

impl TopicSetting {
    pub fn new(topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Ordered list of subscription filters from one SUBSCRIBE
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicSettings(pub Vec<TopicSetting>);

impl TopicSettings {
    pub fn new(settings: Vec<TopicSetting>) -> Self {
        Self(settings)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TopicSetting> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<TopicSetting>> for TopicSettings {
    fn from(settings: Vec<TopicSetting>) -> Self {
        Self(settings)
    }
}

impl std::ops::Index<usize> for TopicSettings {
    type Output = TopicSetting;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}
