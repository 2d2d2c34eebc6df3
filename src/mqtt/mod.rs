//! MQTT value types and topic grammars

mod message;
mod topic;

pub use message::{Message, Qos, TopicSetting, TopicSettings};
pub use topic::{
    user_prefixed, NodeDatumTopic, TopicGrammar, UserTopic, DEFAULT_NODE_DATUM_TOPIC_REGEX,
    DEFAULT_USER_TOPIC_REGEX, NODE_WILDCARD, USER_TOPIC_PREFIX,
};
