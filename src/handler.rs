use crate::error::CallError;
use crate::events::{EventId, ScriptId};
use crate::key::HandleKey;
use crate::scripts::ScriptModule;
use rhai::{Dynamic, FnPtr};
use std::fmt;
use std::rc::Rc;

/// A script function bound to the module that compiled it.
#[derive(Clone)]
pub struct ScriptCallable {
    module: Rc<ScriptModule>,
    function: FnPtr,
    accepts_key: bool,
}

impl ScriptCallable {
    pub fn new(module: Rc<ScriptModule>, function: FnPtr) -> Self {
        let accepts_key = module.arity(&function) >= 2;
        Self { module, function, accepts_key }
    }

    pub fn accepts_key(&self) -> bool {
        self.accepts_key
    }

    pub fn function_name(&self) -> &str {
        self.function.fn_name()
    }

    fn call(&self, payload: &Dynamic, key: &HandleKey) -> Result<(), CallError> {
        let engine = self.module.engine();
        let ast = self.module.ast();
        let result = if self.accepts_key {
            self.function.call::<Dynamic>(engine, ast, (payload.clone(), key.to_dynamic()))
        } else {
            self.function.call::<Dynamic>(engine, ast, (payload.clone(),))
        };
        result.map(|_| ()).map_err(|err| CallError::new(err.to_string()))
    }
}

/// Host-side callback. Native callables have no failure channel.
#[derive(Clone)]
pub struct NativeCallable(Rc<dyn Fn(&Dynamic, &HandleKey)>);

impl NativeCallable {
    pub fn new(f: impl Fn(&Dynamic, &HandleKey) + 'static) -> Self {
        Self(Rc::new(f))
    }
}

/// The two call conventions a handler can use.
#[derive(Clone)]
pub enum Callable {
    Script(ScriptCallable),
    Native(NativeCallable),
}

impl Callable {
    pub fn native(f: impl Fn(&Dynamic, &HandleKey) + 'static) -> Self {
        Callable::Native(NativeCallable::new(f))
    }

    pub fn call(&self, payload: &Dynamic, key: &HandleKey) -> Result<(), CallError> {
        match self {
            Callable::Script(script) => script.call(payload, key),
            Callable::Native(native) => {
                (native.0)(payload, key);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Script(script) => write!(f, "Script({})", script.function_name()),
            Callable::Native(_) => write!(f, "Native"),
        }
    }
}

/// A registered callback plus its ordering and filtering metadata.
///
/// Handlers are created by the owning event's `add` and never change
/// afterwards; they are shared by reference with invocation snapshots.
#[derive(Debug)]
pub struct Handler {
    event: EventId,
    script: ScriptId,
    callable: Callable,
    name: String,
    order: String,
    key: HandleKey,
    sequence: i64,
}

impl Handler {
    pub(crate) fn new(
        event: EventId,
        script: ScriptId,
        callable: Callable,
        name: String,
        order: String,
        key: HandleKey,
        sequence: i64,
    ) -> Self {
        Self { event, script, callable, name, order, key, sequence }
    }

    pub fn event(&self) -> EventId {
        self.event
    }

    pub fn script(&self) -> ScriptId {
        self.script
    }

    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> &str {
        &self.order
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

/// Request to attach a handler to an event.
#[derive(Debug, Clone)]
pub struct AddHandlerArgs {
    pub script: ScriptId,
    pub callable: Callable,
    /// Defaults to the event's first order bucket.
    pub order: Option<String>,
    pub key: HandleKey,
    pub sequence: i64,
    /// Synthesized as `"{script}-{serial}"` when absent.
    pub name: Option<String>,
    /// Diagnostic location reported with registration errors.
    pub trace: String,
}

impl AddHandlerArgs {
    pub fn new(script: ScriptId, callable: Callable) -> Self {
        Self {
            script,
            callable,
            order: None,
            key: HandleKey::Wildcard,
            sequence: 0,
            name: None,
            trace: String::new(),
        }
    }

    pub fn native(f: impl Fn(&Dynamic, &HandleKey) + 'static) -> Self {
        Self::new(ScriptId::NATIVE, Callable::native(f))
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn key(mut self, key: impl Into<HandleKey>) -> Self {
        self.key = key.into();
        self
    }

    pub fn sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}
