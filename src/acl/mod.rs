//! Topic authorization
//!
//! Decides per topic whether an actor may publish or subscribe, and rewrites
//! topics and QoS where configured.

mod evaluator;
mod rules;

pub use evaluator::{AuthorizationEngine, EngineSettings};
pub use rules::Denial;
