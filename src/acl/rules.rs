//! Topic access checks
//!
//! Each check returns the [`Denial`] that stops evaluation. Node datum checks
//! run in a fixed order: user id, node id, source id, aggregation.

use crate::actor::{Actor, Aggregation};
use crate::mqtt::{NodeDatumTopic, UserTopic, NODE_WILDCARD};
use std::fmt;

/// Reason a topic was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The actor may not publish at all
    PublishNotAllowed,
    /// The actor's policy has expired
    PolicyExpired,
    /// The topic matches no recognised grammar
    UnknownTopic,
    /// The topic's user id differs from the actor's, or the actor has none
    UserMismatch,
    /// A user prefix is required but the actor has no user id
    NoUserId,
    /// A generic topic without the actor's user prefix
    UserScopeRequired,
    /// Wildcard node ids are not permitted for this actor
    NodeWildcard,
    /// The node id is not numeric
    InvalidNodeId,
    /// The node id is not among the actor's allowed nodes
    NodeNotAllowed,
    /// The source id matches no policy source pattern
    SourceNotAllowed,
    /// The aggregation segment is not a known aggregation
    UnknownAggregation,
    /// The aggregation is not permitted by the policy
    AggregationNotAllowed,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublishNotAllowed => "publish-not-allowed",
            Self::PolicyExpired => "policy-expired",
            Self::UnknownTopic => "unknown-topic",
            Self::UserMismatch => "user-mismatch",
            Self::NoUserId => "no-user-id",
            Self::UserScopeRequired => "user-scope-required",
            Self::NodeWildcard => "node-wildcard",
            Self::InvalidNodeId => "invalid-node-id",
            Self::NodeNotAllowed => "node-not-allowed",
            Self::SourceNotAllowed => "source-not-allowed",
            Self::UnknownAggregation => "unknown-aggregation",
            Self::AggregationNotAllowed => "aggregation-not-allowed",
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type CheckResult = Result<(), Denial>;

/// Run all node datum checks in order
pub fn check_node_datum(
    actor: &Actor,
    topic: &NodeDatumTopic<'_>,
    allow_topic_prefix: bool,
) -> CheckResult {
    check_user(actor, topic.user_id)?;
    check_node(actor, topic.node_id, allow_topic_prefix)?;
    check_source(actor, topic.source_id)?;
    check_aggregation(actor, topic.aggregation)
}

/// A user id in the topic must be the actor's own
pub fn check_user(actor: &Actor, topic_user_id: Option<&str>) -> CheckResult {
    let Some(topic_user_id) = topic_user_id else {
        return Ok(());
    };
    match (actor.user_id(), topic_user_id.parse::<i64>()) {
        (Some(actor_user_id), Ok(id)) if actor_user_id == id => Ok(()),
        _ => Err(Denial::UserMismatch),
    }
}

/// A generic topic must be scoped to the actor's user
///
/// Outside topic-prefix mode the `user/{id}/` prefix has to be written out.
/// Filters that could reach node datum topics below it are refused when the
/// policy narrows datum access.
pub fn check_user_topic(
    actor: &Actor,
    topic: &UserTopic<'_>,
    allow_topic_prefix: bool,
) -> CheckResult {
    check_user(actor, topic.user_id)?;
    if topic.user_id.is_none() && !allow_topic_prefix {
        return Err(Denial::UserScopeRequired);
    }
    if restricts_datum(actor) && reaches_node_topics(topic.topic) {
        return Err(Denial::NodeNotAllowed);
    }
    Ok(())
}

fn restricts_datum(actor: &Actor) -> bool {
    actor.policy().is_some_and(|policy| {
        policy.restricts_nodes() || policy.restricts_sources() || policy.restricts_aggregations()
    })
}

fn reaches_node_topics(topic: &str) -> bool {
    matches!(topic.split('/').next(), Some("node" | "+" | "#"))
}

/// The node must be one the actor may access
///
/// The `+` wildcard is only accepted in topic-prefix mode, for an actor with a
/// user id whose policy does not restrict node ids; the user prefix then
/// confines the wildcard to the actor's own nodes.
pub fn check_node(actor: &Actor, node_id: &str, allow_topic_prefix: bool) -> CheckResult {
    if node_id == NODE_WILDCARD {
        return if allow_topic_prefix && actor.user_id().is_some() && !actor.restricts_nodes() {
            Ok(())
        } else {
            Err(Denial::NodeWildcard)
        };
    }

    let node_id: i64 = node_id.parse().map_err(|_| Denial::InvalidNodeId)?;
    if actor.allowed_node_ids().contains(&node_id) {
        Ok(())
    } else {
        Err(Denial::NodeNotAllowed)
    }
}

/// The source id must match a policy source pattern, if any are set
///
/// A `#` broker wildcard is expanded to `#/#` first, so only patterns allowing
/// more than one level (`**`) can grant it.
pub fn check_source(actor: &Actor, source_id: &str) -> CheckResult {
    let Some(patterns) = actor.source_patterns() else {
        return Ok(());
    };
    let path = source_id.replace('#', "#/#");
    if patterns.matches(&path) {
        Ok(())
    } else {
        Err(Denial::SourceNotAllowed)
    }
}

/// The aggregation must be known, and permitted by the policy if restricted
pub fn check_aggregation(actor: &Actor, aggregation: &str) -> CheckResult {
    let aggregation: Aggregation = aggregation
        .parse()
        .map_err(|_| Denial::UnknownAggregation)?;
    match actor.policy() {
        Some(policy)
            if policy.restricts_aggregations() && !policy.aggregations.contains(&aggregation) =>
        {
            Err(Denial::AggregationNotAllowed)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorType, SecurityPolicy};

    fn user_actor(policy: Option<SecurityPolicy>) -> Actor {
        Actor::token("tok", ActorType::UserToken, Some(7), policy, [1, 2])
    }

    #[test]
    fn test_user_check() {
        let actor = user_actor(None);
        assert_eq!(check_user(&actor, None), Ok(()));
        assert_eq!(check_user(&actor, Some("7")), Ok(()));
        assert_eq!(check_user(&actor, Some("8")), Err(Denial::UserMismatch));

        let anonymous = Actor::token("tok", ActorType::UserToken, None, None, [1]);
        assert_eq!(check_user(&anonymous, Some("7")), Err(Denial::UserMismatch));
    }

    #[test]
    fn test_user_topic_check() {
        let topic = |user_id, topic| UserTopic { user_id, topic };
        let open = user_actor(None);
        let restricted = user_actor(Some(SecurityPolicy {
            node_ids: [1].into_iter().collect(),
            ..Default::default()
        }));

        assert_eq!(
            check_user_topic(&open, &topic(None, "#"), false),
            Err(Denial::UserScopeRequired)
        );
        assert_eq!(check_user_topic(&open, &topic(None, "#"), true), Ok(()));
        assert_eq!(check_user_topic(&open, &topic(Some("7"), "#"), false), Ok(()));
        assert_eq!(
            check_user_topic(&restricted, &topic(Some("7"), "node/#"), false),
            Err(Denial::NodeNotAllowed)
        );
        assert_eq!(
            check_user_topic(&restricted, &topic(Some("7"), "+/x"), false),
            Err(Denial::NodeNotAllowed)
        );
        assert_eq!(
            check_user_topic(&restricted, &topic(Some("7"), "events/#"), false),
            Ok(())
        );
        assert_eq!(
            check_user_topic(&restricted, &topic(Some("8"), "events"), false),
            Err(Denial::UserMismatch)
        );
    }

    #[test]
    fn test_node_check() {
        let actor = user_actor(None);
        assert_eq!(check_node(&actor, "1", false), Ok(()));
        assert_eq!(check_node(&actor, "3", false), Err(Denial::NodeNotAllowed));
        assert_eq!(check_node(&actor, "x", false), Err(Denial::InvalidNodeId));
    }

    #[test]
    fn test_node_wildcard_conditions() {
        let actor = user_actor(None);
        assert_eq!(check_node(&actor, "+", false), Err(Denial::NodeWildcard));
        assert_eq!(check_node(&actor, "+", true), Ok(()));

        let restricted = user_actor(Some(SecurityPolicy {
            node_ids: [1].into_iter().collect(),
            ..Default::default()
        }));
        assert_eq!(check_node(&restricted, "+", true), Err(Denial::NodeWildcard));

        let anonymous = Actor::token("tok", ActorType::UserToken, None, None, [1]);
        assert_eq!(check_node(&anonymous, "+", true), Err(Denial::NodeWildcard));
    }

    #[test]
    fn test_source_check() {
        let actor = user_actor(Some(SecurityPolicy {
            source_ids: ["power/**".to_string(), "meter/*".to_string()]
                .into_iter()
                .collect(),
            ..Default::default()
        }));

        assert_eq!(check_source(&actor, "/power/inverter/1"), Ok(()));
        assert_eq!(check_source(&actor, "power/#"), Ok(()));
        assert_eq!(check_source(&actor, "meter/1"), Ok(()));
        assert_eq!(check_source(&actor, "meter/+"), Ok(()));
        assert_eq!(check_source(&actor, "meter/#"), Err(Denial::SourceNotAllowed));
        assert_eq!(check_source(&actor, "weather"), Err(Denial::SourceNotAllowed));

        assert_eq!(check_source(&user_actor(None), "anything/#"), Ok(()));
    }

    #[test]
    fn test_aggregation_check() {
        let actor = user_actor(Some(SecurityPolicy {
            aggregations: [Aggregation::Hour].into_iter().collect(),
            ..Default::default()
        }));

        assert_eq!(check_aggregation(&actor, "Hour"), Ok(()));
        assert_eq!(check_aggregation(&actor, "h"), Ok(()));
        assert_eq!(
            check_aggregation(&actor, "Day"),
            Err(Denial::AggregationNotAllowed)
        );
        assert_eq!(
            check_aggregation(&actor, "Fortnight"),
            Err(Denial::UnknownAggregation)
        );
        assert_eq!(check_aggregation(&user_actor(None), "Average"), Ok(()));
    }

    #[test]
    fn test_checks_short_circuit_in_order() {
        let actor = user_actor(Some(SecurityPolicy {
            aggregations: [Aggregation::Hour].into_iter().collect(),
            ..Default::default()
        }));
        let topic = NodeDatumTopic {
            user_id: Some("8"),
            node_id: "99",
            aggregation: "Day",
            source_id: "a",
        };
        assert_eq!(
            check_node_datum(&actor, &topic, false),
            Err(Denial::UserMismatch)
        );

        let topic = NodeDatumTopic {
            user_id: None,
            ..topic
        };
        assert_eq!(
            check_node_datum(&actor, &topic, false),
            Err(Denial::NodeNotAllowed)
        );
    }
}
