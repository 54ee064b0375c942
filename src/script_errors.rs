use crate::events::{EventId, ScriptId};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    pub script: ScriptId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    pub message: String,
}

#[derive(Debug)]
struct ErrorRing {
    entries: VecDeque<ScriptError>,
    capacity: usize,
    dropped: u64,
}

/// Bounded collector for failures attributed to scripts. Cloning yields
/// another handle onto the same log.
#[derive(Clone, Debug)]
pub struct ScriptErrorLog(Rc<RefCell<ErrorRing>>);

impl ScriptErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self(Rc::new(RefCell::new(ErrorRing {
            entries: VecDeque::with_capacity(capacity.min(1_024)),
            capacity,
            dropped: 0,
        })))
    }

    pub fn report(&self, error: ScriptError) {
        let mut ring = self.0.borrow_mut();
        if ring.entries.len() == ring.capacity {
            ring.entries.pop_front();
            ring.dropped += 1;
        }
        ring.entries.push_back(error);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().entries.is_empty()
    }

    /// Number of errors evicted because the log was full.
    pub fn dropped(&self) -> u64 {
        self.0.borrow().dropped
    }

    pub fn snapshot(&self) -> Vec<ScriptError> {
        self.0.borrow().entries.iter().cloned().collect()
    }

    pub fn errors_for(&self, script: ScriptId) -> Vec<ScriptError> {
        self.0.borrow().entries.iter().filter(|error| error.script == script).cloned().collect()
    }

    pub fn drain(&self) -> Vec<ScriptError> {
        self.0.borrow_mut().entries.drain(..).collect()
    }
}

impl Default for ScriptErrorLog {
    fn default() -> Self {
        Self::new(256)
    }
}
