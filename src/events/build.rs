use super::{EventIdentity, EventSettings, EventShape, InvocableEvent, ScriptId};
use crate::error::{RegistrationError, RegistryError};
use crate::handler::AddHandlerArgs;
use crate::key::HandleKey;

/// Handler request deferred until the event's shape is final.
#[derive(Debug, Clone)]
pub enum PendingOperation {
    Add(AddHandlerArgs),
    Override { target: String, args: AddHandlerArgs },
}

impl PendingOperation {
    pub fn script(&self) -> ScriptId {
        match self {
            PendingOperation::Add(args) | PendingOperation::Override { args, .. } => args.script,
        }
    }
}

/// An event while scripts are still loading. It accumulates handler
/// requests without validating them and cannot be invoked.
#[derive(Debug)]
pub struct BuildEvent {
    identity: EventIdentity,
    built: bool,
    shape: EventShape,
    declared: Option<(ScriptId, EventShape)>,
    operations: Vec<PendingOperation>,
}

impl BuildEvent {
    pub fn new(identity: EventIdentity) -> Self {
        Self { identity, built: false, shape: EventShape::default(), declared: None, operations: Vec::new() }
    }

    pub fn identity(&self) -> EventIdentity {
        self.identity
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn shape(&self) -> &EventShape {
        &self.shape
    }

    pub fn operations(&self) -> &[PendingOperation] {
        &self.operations
    }

    /// Queues a handler; validation happens when the event is finalized.
    pub fn add(&mut self, args: AddHandlerArgs) {
        self.operations.push(PendingOperation::Add(args));
    }

    pub fn override_handler(&mut self, target: impl Into<String>, args: AddHandlerArgs) {
        self.operations.push(PendingOperation::Override { target: target.into(), args });
    }

    /// Records the shape a script declared while loading.
    pub fn declare(&mut self, owner: ScriptId, shape: EventShape) {
        self.identity.owner = owner;
        self.declared = Some((owner, shape));
    }

    pub fn declared(&self) -> Option<&(ScriptId, EventShape)> {
        self.declared.as_ref()
    }

    /// Drops queued requests issued by scripts failing `is_script_valid`.
    pub fn discard_operations(&mut self, is_script_valid: impl Fn(ScriptId) -> bool) -> usize {
        let before = self.operations.len();
        self.operations.retain(|operation| is_script_valid(operation.script()));
        before - self.operations.len()
    }

    /// Fixes the final shape. Only the first call takes effect; later calls
    /// return false and leave the event untouched.
    pub fn try_finalize<I, S>(&mut self, owner: ScriptId, orders: I, keys: impl IntoIterator<Item = HandleKey>) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.built {
            return false;
        }
        self.identity.owner = owner;
        self.shape = EventShape::new(orders, keys);
        self.built = true;
        true
    }

    /// Finalizes with the declared shape, or the default single bucket when
    /// nothing was declared.
    pub fn finalize_declared(&mut self) -> bool {
        let (owner, shape) = match self.declared.take() {
            Some((owner, shape)) => (owner, shape),
            None => (self.identity.owner, EventShape::default()),
        };
        let keys: Vec<HandleKey> = shape.keys().iter().cloned().collect();
        self.try_finalize(owner, shape.orders().iter().cloned(), keys)
    }

    /// Replays every queued request through the invocable event's normal
    /// `add` path. Requests failing validation are returned alongside the
    /// event; the rest are installed.
    pub fn into_invocable(
        self,
        settings: EventSettings,
    ) -> Result<(InvocableEvent, Vec<RegistrationError>), RegistryError> {
        if !self.built {
            return Err(RegistryError::NotFinalized(self.identity.id));
        }
        let mut event = InvocableEvent::new(self.identity, self.shape, settings);
        let mut errors = Vec::new();
        for operation in self.operations {
            let result = match operation {
                PendingOperation::Add(args) => event.add(args),
                PendingOperation::Override { target, args } => event.override_handler(&target, args),
            };
            if let Err(err) = result {
                errors.push(err);
            }
        }
        Ok((event, errors))
    }
}
