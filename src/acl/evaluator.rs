//! Topic authorization engine

use crate::actor::{Actor, ActorType};
use crate::clock::{Clock, SystemClock};
use crate::config::AuthzConfig;
use crate::mqtt::{user_prefixed, Message, Qos, TopicGrammar, TopicSetting, TopicSettings};
use crate::qos::QosEnforcer;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

use super::rules::{check_node_datum, check_user_topic, Denial};

/// Compiled authorization settings
pub struct EngineSettings {
    grammar: TopicGrammar,
    allow_topic_prefix: bool,
    qos: QosEnforcer,
}

impl EngineSettings {
    pub fn from_config(config: &AuthzConfig) -> anyhow::Result<Self> {
        Ok(Self {
            grammar: TopicGrammar::new(&config.node_datum_topic_regex, &config.user_topic_regex)?,
            allow_topic_prefix: config.allow_topic_prefix,
            qos: QosEnforcer::new(config.max_qos),
        })
    }

    /// Topic to route to when the user prefix must be added
    ///
    /// `Ok(None)` leaves the topic as it is.
    fn prefixed_topic(
        &self,
        actor: &Actor,
        topic_user_id: Option<&str>,
        topic: &str,
    ) -> Result<Option<String>, Denial> {
        if !self.allow_topic_prefix || topic_user_id.is_some() {
            return Ok(None);
        }
        let user_id = actor.user_id().ok_or(Denial::NoUserId)?;
        Ok(Some(user_prefixed(user_id, topic)))
    }

    fn route_publish(&self, actor: &Actor, topic: &str) -> Result<Option<String>, Denial> {
        let parsed = self
            .grammar
            .parse_node_datum(topic)
            .ok_or(Denial::UnknownTopic)?;
        check_node_datum(actor, &parsed, self.allow_topic_prefix)?;
        self.prefixed_topic(actor, parsed.user_id, topic)
    }

    /// Evaluate one subscription filter; `Ok(None)` means granted unchanged
    fn route_subscribe(
        &self,
        actor: &Actor,
        setting: &TopicSetting,
    ) -> Result<Option<TopicSetting>, Denial> {
        let topic = setting.topic.as_str();
        let prefixed = if let Some(parsed) = self.grammar.parse_node_datum(topic) {
            check_node_datum(actor, &parsed, self.allow_topic_prefix)?;
            self.prefixed_topic(actor, parsed.user_id, topic)?
        } else if actor.actor_type() == ActorType::UserToken {
            let parsed = self.grammar.parse_user(topic).ok_or(Denial::UnknownTopic)?;
            check_user_topic(actor, &parsed, self.allow_topic_prefix)?;
            self.prefixed_topic(actor, parsed.user_id, topic)?
        } else {
            return Err(Denial::UnknownTopic);
        };

        let qos = self.qos.enforce(setting.qos);
        if prefixed.is_none() && qos == setting.qos {
            return Ok(None);
        }
        Ok(Some(TopicSetting::new(
            prefixed.unwrap_or_else(|| setting.topic.clone()),
            qos,
        )))
    }
}

/// Authorization engine - decides per topic whether an actor may publish or
/// subscribe, and how the topic is routed
pub struct AuthorizationEngine {
    settings: RwLock<EngineSettings>,
    clock: Arc<dyn Clock>,
}

impl AuthorizationEngine {
    /// Create an engine from configuration
    pub fn new(config: &AuthzConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &AuthzConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        Ok(Self {
            settings: RwLock::new(EngineSettings::from_config(config)?),
            clock,
        })
    }

    /// Replace the topic grammars and routing settings
    pub fn reconfigure(&self, config: &AuthzConfig) -> anyhow::Result<()> {
        self.apply(EngineSettings::from_config(config)?);
        Ok(())
    }

    /// Swap in settings compiled with [`EngineSettings::from_config`]
    pub fn apply(&self, settings: EngineSettings) {
        *self.settings.write() = settings;
    }

    /// Evaluate a publish
    ///
    /// Returns `None` when denied, the borrowed message when allowed as is,
    /// and an owned copy when the topic or QoS was rewritten.
    pub fn evaluate_publish<'m>(
        &self,
        actor: &Actor,
        message: &'m Message,
    ) -> Option<Cow<'m, Message>> {
        match self.check_publish(actor, message) {
            Ok(routed) => Some(routed),
            Err(denial) => {
                debug!(
                    token_id = ?actor.token_id(),
                    user_id = ?actor.user_id(),
                    topic = %message.topic,
                    reason = %denial,
                    "Publish denied"
                );
                None
            }
        }
    }

    fn check_publish<'m>(
        &self,
        actor: &Actor,
        message: &'m Message,
    ) -> Result<Cow<'m, Message>, Denial> {
        if !actor.is_publish_allowed() {
            return Err(Denial::PublishNotAllowed);
        }
        if !actor.policy_valid_at(self.clock.now()) {
            return Err(Denial::PolicyExpired);
        }

        let settings = self.settings.read();
        let prefixed = settings.route_publish(actor, &message.topic)?;
        let qos = settings.qos.enforce(message.qos);

        if prefixed.is_none() && qos == message.qos {
            return Ok(Cow::Borrowed(message));
        }
        let topic = prefixed.unwrap_or_else(|| message.topic.clone());
        debug!(from = %message.topic, to = %topic, qos = %qos, "Publish rerouted");
        Ok(Cow::Owned(message.with_route(topic, qos)))
    }

    /// Evaluate a batch of subscription filters
    ///
    /// Every filter is decided on its own. Denied filters keep their place in
    /// the batch with QoS set to [`Qos::NotAllowed`]. The batch is borrowed
    /// back unchanged when nothing was rewritten.
    pub fn evaluate_subscribe<'s>(
        &self,
        actor: &Actor,
        settings: &'s TopicSettings,
    ) -> Cow<'s, TopicSettings> {
        let policy_valid = actor.policy_valid_at(self.clock.now());
        let engine = self.settings.read();
        let mut changed: Option<Vec<TopicSetting>> = None;

        for (idx, setting) in settings.iter().enumerate() {
            let outcome = if policy_valid {
                engine.route_subscribe(actor, setting)
            } else {
                Err(Denial::PolicyExpired)
            };

            let replacement = match outcome {
                Ok(None) => continue,
                Ok(Some(routed)) => routed,
                Err(denial) => {
                    debug!(
                        token_id = ?actor.token_id(),
                        user_id = ?actor.user_id(),
                        topic = %setting.topic,
                        reason = %denial,
                        "Subscribe denied"
                    );
                    TopicSetting::new(setting.topic.clone(), Qos::NotAllowed)
                }
            };

            if replacement != *setting {
                changed.get_or_insert_with(|| settings.0.clone())[idx] = replacement;
            }
        }

        match changed {
            Some(routed) => Cow::Owned(TopicSettings::new(routed)),
            None => Cow::Borrowed(settings),
        }
    }

    /// Source id of a node datum topic, if the message topic is one
    pub fn source_id_for_publish(&self, message: &Message) -> Option<String> {
        self.settings
            .read()
            .grammar
            .parse_node_datum(&message.topic)
            .map(|parsed| parsed.source_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Aggregation, SecurityPolicy};
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn make_engine(allow_topic_prefix: bool, max_qos: Option<Qos>) -> AuthorizationEngine {
        let config = AuthzConfig {
            allow_topic_prefix,
            max_qos,
            ..Default::default()
        };
        AuthorizationEngine::new(&config).unwrap()
    }

    fn make_node(node_id: i64) -> Actor {
        Actor::node(node_id, Some(7))
    }

    fn make_user(policy: Option<SecurityPolicy>) -> Actor {
        Actor::token("tok", ActorType::UserToken, Some(7), policy, [123])
    }

    fn publish(topic: &str, qos: Qos) -> Message {
        Message::new(topic, qos, false, b"{}".to_vec())
    }

    #[test]
    fn test_publish_allowed_unchanged() {
        let engine = make_engine(false, None);
        let message = publish("node/123/datum/Average/foo", Qos::AtLeastOnce);

        let result = engine.evaluate_publish(&make_node(123), &message).unwrap();
        assert!(matches!(result, Cow::Borrowed(m) if std::ptr::eq(m, &message)));
    }

    #[test]
    fn test_publish_denials() {
        let engine = make_engine(false, None);
        let node = make_node(123);

        assert!(engine
            .evaluate_publish(&node, &publish("node/124/datum/Average/foo", Qos::AtMostOnce))
            .is_none());
        assert!(engine
            .evaluate_publish(&node, &publish("some/other/topic", Qos::AtMostOnce))
            .is_none());
        assert!(engine
            .evaluate_publish(&node, &publish("user/8/node/123/datum/Average/foo", Qos::AtMostOnce))
            .is_none());
        assert!(engine
            .evaluate_publish(&node, &publish("node/123/datum/Weekly/foo", Qos::AtMostOnce))
            .is_none());

        // tokens never publish
        assert!(engine
            .evaluate_publish(&make_user(None), &publish("node/123/datum/Average/foo", Qos::AtMostOnce))
            .is_none());
    }

    #[test]
    fn test_publish_prefix_and_qos_rewrite() {
        let engine = make_engine(true, Some(Qos::AtMostOnce));
        let message = publish("node/123/datum/0/foo", Qos::ExactlyOnce);

        let result = engine.evaluate_publish(&make_node(123), &message).unwrap();
        let routed = result.into_owned();
        assert_eq!(routed.topic, "user/7/node/123/datum/0/foo");
        assert_eq!(routed.qos, Qos::AtMostOnce);
        assert_eq!(routed.payload, message.payload);
    }

    #[test]
    fn test_publish_prefix_without_user_denied() {
        let engine = make_engine(true, None);
        let orphan = Actor::node(123, None);
        assert!(engine
            .evaluate_publish(&orphan, &publish("node/123/datum/0/foo", Qos::AtMostOnce))
            .is_none());
    }

    #[test]
    fn test_subscribe_partial_grant() {
        let engine = make_engine(false, None);
        let settings = TopicSettings::new(vec![
            TopicSetting::new("node/123/datum/Average/foo", Qos::AtLeastOnce),
            TopicSetting::new("node/999/datum/Average/foo", Qos::AtLeastOnce),
        ]);

        let result = engine.evaluate_subscribe(&make_user(None), &settings);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], settings[0]);
        assert_eq!(result[1].topic, "node/999/datum/Average/foo");
        assert_eq!(result[1].qos, Qos::NotAllowed);
    }

    #[test]
    fn test_subscribe_unchanged_is_borrowed() {
        let engine = make_engine(false, None);
        let settings = TopicSettings::new(vec![TopicSetting::new(
            "node/123/datum/Hour/#",
            Qos::AtMostOnce,
        )]);
        let result = engine.evaluate_subscribe(&make_user(None), &settings);
        assert!(matches!(result, Cow::Borrowed(_)));
    }

    #[test]
    fn test_subscribe_node_wildcard() {
        let settings = TopicSettings::new(vec![TopicSetting::new(
            "node/+/datum/Average/foo",
            Qos::AtMostOnce,
        )]);

        let result = make_engine(false, None).evaluate_subscribe(&make_user(None), &settings);
        assert_eq!(result[0].qos, Qos::NotAllowed);

        let result = make_engine(true, None).evaluate_subscribe(&make_user(None), &settings);
        assert_eq!(result[0].topic, "user/7/node/+/datum/Average/foo");
        assert_eq!(result[0].qos, Qos::AtMostOnce);

        let restricted = make_user(Some(SecurityPolicy {
            node_ids: [123].into_iter().collect(),
            ..Default::default()
        }));
        let result = make_engine(true, None).evaluate_subscribe(&restricted, &settings);
        assert_eq!(result[0].qos, Qos::NotAllowed);
    }

    #[test]
    fn test_subscribe_user_topics() {
        let engine = make_engine(true, None);
        let settings = TopicSettings::new(vec![
            TopicSetting::new("user/7/events", Qos::AtMostOnce),
            TopicSetting::new("user/8/events", Qos::AtMostOnce),
            TopicSetting::new("events", Qos::AtMostOnce),
        ]);

        let result = engine.evaluate_subscribe(&make_user(None), &settings);
        assert_eq!(result[0], settings[0]);
        assert_eq!(result[1].qos, Qos::NotAllowed);
        assert_eq!(result[2].topic, "user/7/events");

        // only user tokens fall back to the user grammar
        let result = engine.evaluate_subscribe(&make_node(123), &settings);
        assert!(result.iter().all(|s| s.qos == Qos::NotAllowed));
    }

    #[test]
    fn test_subscribe_generic_filters_need_user_scope() {
        let engine = make_engine(false, None);
        let restricted = make_user(Some(SecurityPolicy {
            node_ids: [123].into_iter().collect(),
            ..Default::default()
        }));
        let settings = TopicSettings::new(vec![
            TopicSetting::new("node/+/datum/Average/foo", Qos::AtMostOnce),
            TopicSetting::new("node/#", Qos::AtMostOnce),
            TopicSetting::new("#", Qos::AtMostOnce),
            TopicSetting::new("+/datum/x", Qos::AtMostOnce),
            TopicSetting::new("user/8/#", Qos::AtMostOnce),
            TopicSetting::new("user/7/#", Qos::AtMostOnce),
            TopicSetting::new("user/7/events", Qos::AtMostOnce),
        ]);

        let result = engine.evaluate_subscribe(&restricted, &settings);
        let granted: Vec<_> = result.iter().map(|s| s.qos != Qos::NotAllowed).collect();
        assert_eq!(granted, vec![false, false, false, false, false, false, true]);

        // without a policy the user's own tree is open
        let result = engine.evaluate_subscribe(&make_user(None), &settings);
        assert_eq!(result[1].qos, Qos::NotAllowed);
        assert_eq!(result[2].qos, Qos::NotAllowed);
        assert_eq!(result[5].qos, Qos::AtMostOnce);
    }

    #[test]
    fn test_subscribe_generic_filters_prefixed() {
        let engine = make_engine(true, None);
        let restricted = make_user(Some(SecurityPolicy {
            node_ids: [123].into_iter().collect(),
            ..Default::default()
        }));
        let settings = TopicSettings::new(vec![
            TopicSetting::new("#", Qos::AtMostOnce),
            TopicSetting::new("events", Qos::AtMostOnce),
        ]);

        let result = engine.evaluate_subscribe(&restricted, &settings);
        assert_eq!(result[0].qos, Qos::NotAllowed);
        assert_eq!(result[1].topic, "user/7/events");

        let result = engine.evaluate_subscribe(&make_user(None), &settings);
        assert_eq!(result[0].topic, "user/7/#");
        assert_eq!(result[0].qos, Qos::AtMostOnce);
    }

    #[test]
    fn test_subscribe_policy_restrictions() {
        let engine = make_engine(false, None);
        let actor = make_user(Some(SecurityPolicy {
            source_ids: ["power/**".to_string()].into_iter().collect(),
            aggregations: [Aggregation::Hour].into_iter().collect(),
            ..Default::default()
        }));
        let settings = TopicSettings::new(vec![
            TopicSetting::new("node/123/datum/Hour/power/inverter/1", Qos::AtMostOnce),
            TopicSetting::new("node/123/datum/Hour/weather", Qos::AtMostOnce),
            TopicSetting::new("node/123/datum/Day/power/inverter/1", Qos::AtMostOnce),
        ]);

        let result = engine.evaluate_subscribe(&actor, &settings);
        assert_eq!(result[0].qos, Qos::AtMostOnce);
        assert_eq!(result[1].qos, Qos::NotAllowed);
        assert_eq!(result[2].qos, Qos::NotAllowed);
    }

    #[test]
    fn test_expired_policy_denies() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let engine =
            AuthorizationEngine::with_clock(&AuthzConfig::default(), clock.clone()).unwrap();
        let actor = make_user(Some(SecurityPolicy {
            not_after: Some(now + Duration::minutes(5)),
            ..Default::default()
        }));
        let settings = TopicSettings::new(vec![TopicSetting::new(
            "node/123/datum/Hour/a",
            Qos::AtMostOnce,
        )]);

        assert_eq!(engine.evaluate_subscribe(&actor, &settings)[0].qos, Qos::AtMostOnce);

        clock.advance(Duration::minutes(10));
        assert_eq!(engine.evaluate_subscribe(&actor, &settings)[0].qos, Qos::NotAllowed);
    }

    #[test]
    fn test_source_id_for_publish() {
        let engine = make_engine(false, None);
        assert_eq!(
            engine
                .source_id_for_publish(&publish("node/1/datum/0/power/1", Qos::AtMostOnce))
                .as_deref(),
            Some("power/1")
        );
        assert!(engine
            .source_id_for_publish(&publish("misc", Qos::AtMostOnce))
            .is_none());
    }

    #[test]
    fn test_reconfigure() {
        let engine = make_engine(false, None);
        let message = publish("node/123/datum/0/foo", Qos::AtMostOnce);
        assert!(matches!(
            engine.evaluate_publish(&make_node(123), &message),
            Some(Cow::Borrowed(_))
        ));

        engine
            .reconfigure(&AuthzConfig {
                allow_topic_prefix: true,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            engine.evaluate_publish(&make_node(123), &message),
            Some(Cow::Owned(_))
        ));

        assert!(engine
            .reconfigure(&AuthzConfig {
                node_datum_topic_regex: "(".to_string(),
                ..Default::default()
            })
            .is_err());
    }
}
