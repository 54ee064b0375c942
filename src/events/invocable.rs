use super::{EventId, EventIdentity, EventShape, ScriptId};
use crate::error::RegistrationError;
use crate::handler::{AddHandlerArgs, Handler};
use crate::key::HandleKey;
use crate::profiler::{memory_delta, HandlerSample, MemoryProbe, Profiler, ProfilerSettings};
use crate::script_errors::{ScriptError, ScriptErrorLog};
use bitflags::bitflags;
use rhai::Dynamic;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, warn};

/// Sorted, key-filtered snapshot of an event's handlers.
pub type HandlerList = Rc<[Rc<Handler>]>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InvokeOptions: u8 {
        /// Reuse (and lazily build) the per-key invocation list.
        const CACHE_HANDLERS = 0b0000_0001;
        /// Skip the profiler for this call even when it is enabled.
        const NO_PROFILE = 0b0000_0010;
    }
}

impl Default for InvokeOptions {
    fn default() -> Self {
        InvokeOptions::CACHE_HANDLERS
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSettings {
    pub reject_duplicate_names: bool,
    pub profiler: Option<ProfilerSettings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationReport {
    pub called: usize,
    pub failed: usize,
}

/// A handler displaced by an override. It comes back once the overriding
/// script's handlers are removed, provided its own script is still valid.
#[derive(Debug)]
struct Shadowed {
    handler: Rc<Handler>,
    overrider: ScriptId,
    replacement: String,
}

/// An event whose shape is fixed. Only the handler list mutates.
#[derive(Debug)]
pub struct InvocableEvent {
    identity: EventIdentity,
    shape: EventShape,
    handlers: Vec<Rc<Handler>>,
    shadowed: Vec<Shadowed>,
    sort_dirty: bool,
    invocation_cache: Option<HandlerList>,
    keyed_caches: HashMap<HandleKey, HandlerList>,
    profiler: Option<Profiler>,
    reject_duplicate_names: bool,
    name_serial: u64,
}

impl InvocableEvent {
    pub fn new(identity: EventIdentity, shape: EventShape, settings: EventSettings) -> Self {
        Self {
            identity,
            shape,
            handlers: Vec::new(),
            shadowed: Vec::new(),
            sort_dirty: false,
            invocation_cache: None,
            keyed_caches: HashMap::new(),
            profiler: settings.profiler.map(Profiler::new),
            reject_duplicate_names: settings.reject_duplicate_names,
            name_serial: 0,
        }
    }

    pub fn id(&self) -> EventId {
        self.identity.id
    }

    pub fn identity(&self) -> EventIdentity {
        self.identity
    }

    pub fn shape(&self) -> &EventShape {
        &self.shape
    }

    pub fn orders(&self) -> &[String] {
        self.shape.orders()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers currently displaced by an override.
    pub fn shadowed_len(&self) -> usize {
        self.shadowed.len()
    }

    pub fn profiler(&self) -> Option<&Profiler> {
        self.profiler.as_ref()
    }

    pub fn profiler_mut(&mut self) -> Option<&mut Profiler> {
        self.profiler.as_mut()
    }

    pub fn set_profiler(&mut self, settings: Option<ProfilerSettings>) {
        self.profiler = settings.map(Profiler::new);
    }

    /// Number of per-key invocation lists currently cached.
    pub fn cached_key_count(&self) -> usize {
        self.keyed_caches.len()
    }

    pub fn add(&mut self, args: AddHandlerArgs) -> Result<(), RegistrationError> {
        let order = args.order.unwrap_or_else(|| self.shape.first_order().to_string());
        if self.shape.order_position(&order).is_none() {
            return Err(RegistrationError::BadOrder {
                event: self.identity.id,
                script: args.script,
                order,
                trace: args.trace,
            });
        }
        if !self.shape.permits_key(&args.key) {
            return Err(RegistrationError::BadKey {
                event: self.identity.id,
                script: args.script,
                key: args.key,
                trace: args.trace,
            });
        }
        let name = match args.name {
            Some(name) => name,
            None => loop {
                self.name_serial += 1;
                let candidate = format!("{}-{}", args.script, self.name_serial);
                if !self.handlers.iter().any(|handler| handler.name() == candidate) {
                    break candidate;
                }
            },
        };
        if self.reject_duplicate_names && self.handlers.iter().any(|handler| handler.name() == name) {
            return Err(RegistrationError::DuplicateHandlerName {
                event: self.identity.id,
                script: args.script,
                name,
                trace: args.trace,
            });
        }
        self.handlers.push(Rc::new(Handler::new(
            self.identity.id,
            args.script,
            args.callable,
            name,
            order,
            args.key,
            args.sequence,
        )));
        self.mark_dirty();
        Ok(())
    }

    /// Replaces every handler named `target` with a handler built from
    /// `args`. The replacement inherits the target name when none is given.
    /// Displaced handlers are kept aside until the overriding script goes.
    pub fn override_handler(&mut self, target: &str, mut args: AddHandlerArgs) -> Result<(), RegistrationError> {
        let overrider = args.script;
        let replacement = args.name.get_or_insert_with(|| target.to_string()).clone();
        let previous = std::mem::take(&mut self.handlers);
        let (removed, kept): (Vec<_>, Vec<_>) = previous.into_iter().partition(|handler| handler.name() == target);
        self.handlers = kept;
        match self.add(args) {
            Ok(()) => {
                self.shadowed.extend(removed.into_iter().map(|handler| Shadowed {
                    handler,
                    overrider,
                    replacement: replacement.clone(),
                }));
                Ok(())
            }
            Err(err) => {
                self.handlers.extend(removed);
                self.mark_dirty();
                Err(err)
            }
        }
    }

    /// Handlers ordered by `(bucket position, sequence, name)`. The returned
    /// slice is invalidated by the next mutating call.
    pub fn sorted_handlers(&mut self) -> &[Rc<Handler>] {
        if self.sort_dirty {
            let shape = &self.shape;
            self.handlers.sort_by(|a, b| {
                let a_pos = shape.order_position(a.order()).unwrap_or(usize::MAX);
                let b_pos = shape.order_position(b.order()).unwrap_or(usize::MAX);
                a_pos
                    .cmp(&b_pos)
                    .then_with(|| a.sequence().cmp(&b.sequence()))
                    .then_with(|| a.name().cmp(b.name()))
            });
            self.sort_dirty = false;
        }
        &self.handlers
    }

    pub fn clear_invalid_handlers(&mut self, is_script_valid: impl Fn(ScriptId) -> bool) -> usize {
        self.retain_scripts(is_script_valid)
    }

    pub fn clear_handlers_of(&mut self, script: ScriptId) -> usize {
        self.retain_scripts(|candidate| candidate != script)
    }

    /// Drops every handler that did not originate from native code.
    pub fn clear_all_script_handlers(&mut self) -> usize {
        self.retain_scripts(ScriptId::is_native)
    }

    /// Returns the number of installed handlers removed. Handlers restored
    /// from behind a removed override are not counted.
    fn retain_scripts(&mut self, keep: impl Fn(ScriptId) -> bool) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|handler| keep(handler.script()));
        let removed = before - self.handlers.len();
        let restored = self.settle_shadowed(&keep);
        if removed > 0 || restored > 0 {
            debug!(event = %self.identity.id, removed, restored, "removed handlers");
            self.mark_dirty();
        }
        removed
    }

    /// Forgets shadowed handlers whose own script is gone and reinstates
    /// those whose overrider is gone. When the overrider's replacement was
    /// itself overridden by a surviving script, the handler stays shadowed
    /// behind that script instead.
    fn settle_shadowed(&mut self, keep: &impl Fn(ScriptId) -> bool) -> usize {
        let (alive, gone): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.shadowed).into_iter().partition(|entry| keep(entry.handler.script()));
        let mut restored = 0;
        for mut entry in alive {
            if !keep(entry.overrider) {
                let successor = gone.iter().find(|next| {
                    next.handler.script() == entry.overrider
                        && next.handler.name() == entry.replacement
                        && keep(next.overrider)
                });
                match successor {
                    Some(next) => {
                        entry.overrider = next.overrider;
                        entry.replacement = next.replacement.clone();
                    }
                    None => {
                        self.handlers.push(entry.handler);
                        restored += 1;
                        continue;
                    }
                }
            }
            self.shadowed.push(entry);
        }
        restored
    }

    fn mark_dirty(&mut self) {
        self.sort_dirty = true;
        self.invocation_cache = None;
        self.keyed_caches.clear();
    }

    /// Sorted handlers participating in an invocation with `key`.
    pub fn candidates(&mut self, key: &HandleKey, options: InvokeOptions) -> HandlerList {
        if !options.contains(InvokeOptions::CACHE_HANDLERS) {
            return self.filter_sorted(key);
        }
        if key.is_wildcard() {
            if let Some(list) = &self.invocation_cache {
                return list.clone();
            }
            let list = self.filter_sorted(key);
            self.invocation_cache = Some(list.clone());
            return list;
        }
        if let Some(list) = self.keyed_caches.get(key) {
            return list.clone();
        }
        let list = self.filter_sorted(key);
        debug!(event = %self.identity.id, %key, handlers = list.len(), "cached invocation list");
        self.keyed_caches.insert(key.clone(), list.clone());
        list
    }

    /// A wildcard invocation reaches every handler; any other key reaches
    /// wildcard handlers and handlers bound to an equal key.
    fn filter_sorted(&mut self, key: &HandleKey) -> HandlerList {
        if key.is_wildcard() {
            return self.sorted_handlers().iter().cloned().collect();
        }
        self.sorted_handlers().iter().filter(|handler| handler.key().matches(key)).cloned().collect()
    }

    /// Opens an invocation: snapshots the candidate list and, when profiling,
    /// opens the profiler scope. A nested invocation of the same event while
    /// its scope is open runs unprofiled.
    pub fn begin_invocation(&mut self, key: HandleKey, options: InvokeOptions, probe: MemoryProbe) -> Invocation {
        let mut profiled = false;
        let mut trace_handlers = false;
        if !options.contains(InvokeOptions::NO_PROFILE) {
            if let Some(profiler) = self.profiler.as_mut() {
                if profiler.is_open() {
                    debug!(event = %self.identity.id, "nested invocation skips profiling");
                } else if profiler.begin_event(probe()).is_ok() {
                    profiled = true;
                    trace_handlers = profiler.trace_handlers();
                }
            }
        }
        let handlers = self.candidates(&key, options);
        Invocation { event: self.identity.id, handlers, key, profiled, trace_handlers, probe, samples: None }
    }

    pub fn end_invocation(&mut self, invocation: Invocation) {
        if !invocation.profiled {
            return;
        }
        if let Some(profiler) = self.profiler.as_mut() {
            if let Err(err) = profiler.end_event((invocation.probe)(), invocation.samples) {
                warn!(event = %self.identity.id, "profiler scope mismatch: {err}");
            }
        }
    }

    pub fn invoke(
        &mut self,
        payload: &Dynamic,
        key: HandleKey,
        options: InvokeOptions,
        probe: MemoryProbe,
        errors: &ScriptErrorLog,
    ) -> InvocationReport {
        let mut invocation = self.begin_invocation(key, options, probe);
        let report = invocation.run(payload, errors);
        self.end_invocation(invocation);
        report
    }
}

/// An in-flight invocation. Holds its own snapshot of the handler list, so
/// the event may be mutated (or invoked again) while it runs.
pub struct Invocation {
    event: EventId,
    handlers: HandlerList,
    key: HandleKey,
    profiled: bool,
    trace_handlers: bool,
    probe: MemoryProbe,
    samples: Option<HashMap<String, HandlerSample>>,
}

impl Invocation {
    pub fn event(&self) -> EventId {
        self.event
    }

    pub fn handlers(&self) -> &[Rc<Handler>] {
        &self.handlers
    }

    /// Calls every candidate in order. A failing handler is logged and
    /// reported, and never stops its siblings.
    pub fn run(&mut self, payload: &Dynamic, errors: &ScriptErrorLog) -> InvocationReport {
        let mut report = InvocationReport::default();
        let mut samples = self.trace_handlers.then(HashMap::new);
        for handler in self.handlers.iter() {
            let started = samples.as_ref().map(|_| (Instant::now(), (self.probe)()));
            let result = handler.callable().call(payload, &self.key);
            if let (Some(samples), Some((start, memory))) = (samples.as_mut(), started) {
                let sample: &mut HandlerSample = samples.entry(handler.name().to_string()).or_default();
                sample.duration += start.elapsed();
                sample.memory_delta += memory_delta(memory, (self.probe)());
            }
            report.called += 1;
            if let Err(err) = result {
                report.failed += 1;
                warn!(
                    event = %self.event,
                    handler = handler.name(),
                    script = %handler.script(),
                    "handler failed: {err}"
                );
                if !handler.script().is_native() {
                    errors.report(ScriptError {
                        script: handler.script(),
                        event: Some(self.event),
                        handler: Some(handler.name().to_string()),
                        message: err.message,
                    });
                }
            }
        }
        self.samples = samples;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Callable;
    use crate::profiler::default_memory_probe;
    use std::cell::RefCell;

    fn event(orders: &[&str], keys: Vec<HandleKey>) -> InvocableEvent {
        InvocableEvent::new(
            EventIdentity::new(EventId(10), ScriptId::NATIVE),
            EventShape::new(orders.iter().copied(), keys),
            EventSettings::default(),
        )
    }

    fn recorder(log: &Rc<RefCell<Vec<String>>>, label: &str) -> AddHandlerArgs {
        let log = log.clone();
        let label = label.to_string();
        let name = label_name(&label);
        AddHandlerArgs::native(move |_, _| log.borrow_mut().push(label.clone())).name(name)
    }

    fn label_name(label: &str) -> String {
        format!("h-{label}")
    }

    fn invoke(event: &mut InvocableEvent, key: HandleKey) -> InvocationReport {
        event.invoke(&Dynamic::UNIT, key, InvokeOptions::default(), default_memory_probe, &ScriptErrorLog::default())
    }

    #[test]
    fn sorts_by_bucket_then_sequence_then_name() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut ev = event(&["pre", "main", "post"], vec![]);
        ev.add(recorder(&log, "A").order("main")).unwrap();
        ev.add(recorder(&log, "B").order("pre")).unwrap();
        ev.add(recorder(&log, "C").order("main").sequence(-1)).unwrap();
        invoke(&mut ev, HandleKey::Wildcard);
        assert_eq!(*log.borrow(), vec!["B", "C", "A"]);
    }

    #[test]
    fn missing_order_defaults_to_first_bucket() {
        let mut ev = event(&["early", "late"], vec![]);
        ev.add(AddHandlerArgs::native(|_, _| {}).name("x")).unwrap();
        assert_eq!(ev.sorted_handlers()[0].order(), "early");
    }

    #[test]
    fn rejects_unknown_order_with_context() {
        let mut ev = event(&["main"], vec![]);
        let err = ev
            .add(AddHandlerArgs::new(ScriptId(4), Callable::native(|_, _| {})).order("late").trace("mod.rhai:3"))
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::BadOrder {
                event: EventId(10),
                script: ScriptId(4),
                order: "late".to_string(),
                trace: "mod.rhai:3".to_string()
            }
        );
        assert!(ev.is_empty());
    }

    #[test]
    fn rejects_keys_outside_declared_set() {
        let mut ev = event(&["main"], vec![HandleKey::from("login")]);
        assert!(ev.add(AddHandlerArgs::native(|_, _| {}).key("login")).is_ok());
        assert!(matches!(
            ev.add(AddHandlerArgs::native(|_, _| {}).key("jump")),
            Err(RegistrationError::BadKey { .. })
        ));
    }

    #[test]
    fn synthesized_names_are_unique() {
        let mut ev = event(&["main"], vec![]);
        ev.add(AddHandlerArgs::new(ScriptId(7), Callable::native(|_, _| {}))).unwrap();
        ev.add(AddHandlerArgs::new(ScriptId(7), Callable::native(|_, _| {}))).unwrap();
        let names: Vec<_> = ev.sorted_handlers().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["7-1", "7-2"]);
    }

    #[test]
    fn synthesized_names_skip_names_already_taken() {
        let mut strict = InvocableEvent::new(
            EventIdentity::new(EventId(13), ScriptId::NATIVE),
            EventShape::default(),
            EventSettings { reject_duplicate_names: true, profiler: None },
        );
        strict.add(AddHandlerArgs::new(ScriptId(7), Callable::native(|_, _| {})).name("7-1")).unwrap();
        strict.add(AddHandlerArgs::new(ScriptId(7), Callable::native(|_, _| {}))).unwrap();
        let names: Vec<_> = strict.sorted_handlers().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["7-1", "7-2"]);
    }

    #[test]
    fn duplicate_names_rejected_only_when_enforced() {
        let mut lenient = event(&["main"], vec![]);
        lenient.add(AddHandlerArgs::native(|_, _| {}).name("same")).unwrap();
        lenient.add(AddHandlerArgs::native(|_, _| {}).name("same")).unwrap();
        assert_eq!(lenient.len(), 2);

        let mut strict = InvocableEvent::new(
            EventIdentity::new(EventId(11), ScriptId::NATIVE),
            EventShape::default(),
            EventSettings { reject_duplicate_names: true, profiler: None },
        );
        strict.add(AddHandlerArgs::native(|_, _| {}).name("same")).unwrap();
        assert!(matches!(
            strict.add(AddHandlerArgs::native(|_, _| {}).name("same")),
            Err(RegistrationError::DuplicateHandlerName { .. })
        ));
    }

    #[test]
    fn keyed_invocation_filters_handlers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut ev = event(&["main"], vec![HandleKey::from("login"), HandleKey::from("logout")]);
        ev.add(recorder(&log, "H").key("login")).unwrap();

        invoke(&mut ev, HandleKey::from("login"));
        invoke(&mut ev, HandleKey::from("logout"));
        invoke(&mut ev, HandleKey::Wildcard);
        assert_eq!(*log.borrow(), vec!["H", "H"]);
    }

    #[test]
    fn mutation_invalidates_every_cache() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut ev = event(&["main"], vec![]);
        ev.add(recorder(&log, "A").key("k")).unwrap();
        invoke(&mut ev, HandleKey::from("k"));
        invoke(&mut ev, HandleKey::Wildcard);
        assert_eq!(ev.cached_key_count(), 1);

        ev.add(recorder(&log, "B")).unwrap();
        assert_eq!(ev.cached_key_count(), 0);
        log.borrow_mut().clear();
        invoke(&mut ev, HandleKey::from("k"));
        assert_eq!(*log.borrow(), vec!["A", "B"]);
    }

    #[test]
    fn uncached_invocation_leaves_caches_empty() {
        let mut ev = event(&["main"], vec![]);
        ev.add(AddHandlerArgs::native(|_, _| {}).key("k")).unwrap();
        let report = ev.invoke(
            &Dynamic::UNIT,
            HandleKey::from("k"),
            InvokeOptions::empty(),
            default_memory_probe,
            &ScriptErrorLog::default(),
        );
        assert_eq!(report.called, 1);
        assert_eq!(ev.cached_key_count(), 0);
    }

    #[test]
    fn removal_only_marks_dirty_when_something_changed() {
        let mut ev = event(&["main"], vec![]);
        ev.add(AddHandlerArgs::new(ScriptId(1), Callable::native(|_, _| {}))).unwrap();
        ev.add(AddHandlerArgs::new(ScriptId(2), Callable::native(|_, _| {}))).unwrap();
        ev.add(AddHandlerArgs::native(|_, _| {})).unwrap();
        invoke(&mut ev, HandleKey::from("k"));
        assert_eq!(ev.clear_handlers_of(ScriptId(9)), 0);
        assert_eq!(ev.cached_key_count(), 1);

        assert_eq!(ev.clear_invalid_handlers(|script| script != ScriptId(1)), 1);
        assert_eq!(ev.cached_key_count(), 0);
        assert_eq!(ev.clear_all_script_handlers(), 1);
        assert_eq!(ev.len(), 1);
        assert!(ev.sorted_handlers()[0].script().is_native());
    }

    #[test]
    fn override_replaces_named_handler() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut ev = event(&["main"], vec![]);
        ev.add(recorder(&log, "old")).unwrap();
        let replacement = {
            let log = log.clone();
            AddHandlerArgs::native(move |_, _| log.borrow_mut().push("new".to_string()))
        };
        ev.override_handler("h-old", replacement).unwrap();
        invoke(&mut ev, HandleKey::Wildcard);
        assert_eq!(*log.borrow(), vec!["new"]);
        assert_eq!(ev.sorted_handlers()[0].name(), "h-old");
    }

    fn scripted(log: &Rc<RefCell<Vec<String>>>, script: u32, label: &str) -> AddHandlerArgs {
        let log = log.clone();
        let label = label.to_string();
        AddHandlerArgs::new(ScriptId(script), Callable::native(move |_, _| log.borrow_mut().push(label.clone())))
    }

    #[test]
    fn removing_the_overrider_restores_the_target() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut ev = event(&["main"], vec![]);
        ev.add(scripted(&log, 1, "a").name("hello")).unwrap();
        ev.override_handler("hello", scripted(&log, 2, "b")).unwrap();
        assert_eq!(ev.shadowed_len(), 1);

        assert_eq!(ev.clear_handlers_of(ScriptId(2)), 1);
        assert_eq!(ev.shadowed_len(), 0);
        invoke(&mut ev, HandleKey::Wildcard);
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn shadowed_handler_follows_its_own_script() {
        let mut ev = event(&["main"], vec![]);
        ev.add(AddHandlerArgs::new(ScriptId(1), Callable::native(|_, _| {})).name("hello")).unwrap();
        ev.override_handler("hello", AddHandlerArgs::new(ScriptId(2), Callable::native(|_, _| {}))).unwrap();
        assert_eq!(ev.clear_handlers_of(ScriptId(1)), 0);
        assert_eq!(ev.shadowed_len(), 0);
        assert_eq!(ev.clear_handlers_of(ScriptId(2)), 1);
        assert!(ev.is_empty());
    }

    #[test]
    fn stacked_overrides_unwind_one_script_at_a_time() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut ev = event(&["main"], vec![]);
        ev.add(scripted(&log, 1, "a").name("hello")).unwrap();
        ev.override_handler("hello", scripted(&log, 2, "b")).unwrap();
        ev.override_handler("hello", scripted(&log, 3, "c")).unwrap();

        // The middle script goes first; the original stays behind script 3.
        ev.clear_handlers_of(ScriptId(2));
        invoke(&mut ev, HandleKey::Wildcard);
        ev.clear_handlers_of(ScriptId(3));
        invoke(&mut ev, HandleKey::Wildcard);
        assert_eq!(*log.borrow(), vec!["c", "a"]);
    }

    #[test]
    fn clearing_scripts_restores_overridden_native_handlers() {
        let mut ev = event(&["main"], vec![]);
        ev.add(AddHandlerArgs::native(|_, _| {}).name("builtin")).unwrap();
        ev.override_handler("builtin", AddHandlerArgs::new(ScriptId(4), Callable::native(|_, _| {}))).unwrap();
        assert_eq!(ev.clear_all_script_handlers(), 1);
        assert_eq!(ev.len(), 1);
        assert!(ev.sorted_handlers()[0].script().is_native());
    }

    #[test]
    fn failed_override_restores_target() {
        let mut ev = event(&["main"], vec![]);
        ev.add(AddHandlerArgs::native(|_, _| {}).name("keep")).unwrap();
        assert!(ev.override_handler("keep", AddHandlerArgs::native(|_, _| {}).order("nope")).is_err());
        assert_eq!(ev.len(), 1);
    }

    #[test]
    fn profiled_invocation_records_handler_samples() {
        let mut ev = InvocableEvent::new(
            EventIdentity::new(EventId(12), ScriptId::NATIVE),
            EventShape::default(),
            EventSettings {
                reject_duplicate_names: false,
                profiler: Some(ProfilerSettings { capacity: 4, trace_handlers: true }),
            },
        );
        ev.add(AddHandlerArgs::native(|_, _| {}).name("only")).unwrap();
        invoke(&mut ev, HandleKey::Wildcard);
        ev.invoke(
            &Dynamic::UNIT,
            HandleKey::Wildcard,
            InvokeOptions::CACHE_HANDLERS | InvokeOptions::NO_PROFILE,
            default_memory_probe,
            &ScriptErrorLog::default(),
        );
        let profiler = ev.profiler().expect("profiler enabled");
        assert_eq!(profiler.len(), 1);
        let summaries = profiler.handler_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "only");
        assert!(!profiler.is_open());
    }
}
