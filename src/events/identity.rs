use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry-allocated event identifier. Never reused while an event that
/// references it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u32);

/// Identifier of the script module owning a handler or event declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(pub u32);

impl ScriptId {
    /// Declared by the host itself rather than by a script.
    pub const NATIVE: ScriptId = ScriptId(0);

    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields shared by both lifecycle stages of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventIdentity {
    pub id: EventId,
    pub owner: ScriptId,
}

impl EventIdentity {
    pub fn new(id: EventId, owner: ScriptId) -> Self {
        Self { id, owner }
    }

    pub fn is_native(&self) -> bool {
        self.owner.is_native()
    }
}
