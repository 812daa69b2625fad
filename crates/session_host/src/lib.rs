//! Session Host - the worker context
//!
//! Owns the on-device model sessions and answers the coordinator's requests:
//! - Keeps one model session per conversation key
//! - Streams answers back as `streamUpdate` / `streamComplete` events
//! - Turns generation failures into user-facing text
//! - Hosts worker instances in-process as tokio tasks

pub mod host;
pub mod runtime;
pub mod session_store;

pub use host::InProcessWorkerHost;
pub use runtime::WorkerRuntime;
pub use session_store::{merge_chunk, sniff_image_mime, SessionStore};
