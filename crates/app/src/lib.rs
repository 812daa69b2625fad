//! Percepta terminal front end.
//!
//! Describes a page screenshot or an image with an on-device model and
//! keeps the conversation going on stdin.

pub mod args;
pub mod config;
pub mod media;
pub mod pipeline;
pub mod printer;

pub use pipeline::{follow_turn, Pipeline, TurnOutcome};
