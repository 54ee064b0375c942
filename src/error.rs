use crate::events::{EventId, ScriptId};
use crate::key::HandleKey;
use thiserror::Error;

/// Malformed handler declarations. These surface to whatever loaded the
/// offending script so it can report them to the script author.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("event {event}: script {script} used unknown order '{order}' ({trace})")]
    BadOrder { event: EventId, script: ScriptId, order: String, trace: String },

    #[error("event {event}: script {script} used key {key} outside the declared key set ({trace})")]
    BadKey { event: EventId, script: ScriptId, key: HandleKey, trace: String },

    #[error("event {event}: script {script} registered duplicate handler '{name}' ({trace})")]
    DuplicateHandlerName { event: EventId, script: ScriptId, name: String, trace: String },
}

impl RegistrationError {
    pub fn event(&self) -> EventId {
        match self {
            RegistrationError::BadOrder { event, .. }
            | RegistrationError::BadKey { event, .. }
            | RegistrationError::DuplicateHandlerName { event, .. } => *event,
        }
    }

    pub fn script(&self) -> ScriptId {
        match self {
            RegistrationError::BadOrder { script, .. }
            | RegistrationError::BadKey { script, .. }
            | RegistrationError::DuplicateHandlerName { script, .. } => *script,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("event name '{0}' is already registered")]
    NameTaken(String),

    #[error("no event is registered under id {0}")]
    UnknownEvent(EventId),

    #[error("no event is registered under name '{0}'")]
    UnknownEventName(String),

    #[error("event {0} is still in the build stage and cannot be invoked")]
    NotInvocable(EventId),

    #[error("event {0} has already been finalized")]
    AlreadyFinalized(EventId),

    #[error("event {0} was converted before its shape was finalized")]
    NotFinalized(EventId),

    #[error("event {0} is still alive; retire it before deallocating its id")]
    EventStillAlive(EventId),

    #[error("event {0} is a core event and lives for the registry lifetime")]
    CoreEvent(EventId),

    #[error("event '{name}' was already declared by script {owner}")]
    AlreadyDeclared { name: String, owner: ScriptId },

    #[error("load generation {0} has already been finalized")]
    GenerationFinalized(u64),

    #[error("registry is already borrowed by the caller; it cannot be re-entered from a handler")]
    Busy,

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Misuse of the profiler scope protocol. These indicate a bug in the
/// embedding code rather than in script content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProfilerError {
    #[error("profiler scope opened while another scope is active")]
    NestedScope,

    #[error("profiler scope closed without a matching begin")]
    NoOpenScope,
}

/// Failure raised by a script callable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallError {
    pub message: String,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
