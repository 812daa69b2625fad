use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical conversation. In the browser host this is the
/// owning tab's id, so it serializes as a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(i64);

impl ConversationKey {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for ConversationKey {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One incarnation of the worker context. A recreated worker gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerInstanceId(u64);

impl WorkerInstanceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}
