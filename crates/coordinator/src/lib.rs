//! Coordinator - the long-lived background context
//!
//! Sits between UI surfaces and the worker context:
//! - Brings the worker up, probes it and recreates it when it stops answering
//! - Delivers requests with an acknowledgement deadline and a single retry
//! - Tracks the streaming phase of every conversation and forwards events
//! - Generates a title and suggested questions after the first answer

pub mod delivery;
pub mod error;
pub mod lifecycle;
pub mod meta;
pub mod phase;
pub mod prompts;
pub mod state_machine;
pub mod ui_bus;

#[cfg(test)]
mod testing;

pub use delivery::MessageDelivery;
pub use error::{CoordinatorError, Result};
pub use lifecycle::{LifecycleStats, WorkerLifecycle};
pub use phase::ConversationPhase;
pub use state_machine::{AnalysisRequest, ConversationSnapshot, StreamCoordinator};
pub use ui_bus::{UiBus, UiEvent};
