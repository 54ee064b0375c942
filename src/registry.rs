use crate::error::{RegistrationError, RegistryError};
use crate::events::{
    BuildEvent, EventId, EventIdentity, EventSettings, EventShape, InvocableEvent, Invocation, InvocationReport,
    InvokeOptions, ScriptId,
};
use crate::handler::AddHandlerArgs;
use crate::key::HandleKey;
use crate::profiler::{default_memory_probe, MemoryProbe, ProfilerSettings};
use crate::script_errors::ScriptErrorLog;
use rhai::Dynamic;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Events the host declares itself. They skip the build stage and live for
/// the registry lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreEvent {
    Tick,
    Connect,
    Disconnect,
}

impl CoreEvent {
    pub const ALL: [CoreEvent; 3] = [CoreEvent::Tick, CoreEvent::Connect, CoreEvent::Disconnect];

    pub fn id(self) -> EventId {
        match self {
            CoreEvent::Tick => EventId(1),
            CoreEvent::Connect => EventId(2),
            CoreEvent::Disconnect => EventId(3),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CoreEvent::Tick => "Tick",
            CoreEvent::Connect => "Connect",
            CoreEvent::Disconnect => "Disconnect",
        }
    }

    pub fn orders(self) -> &'static [&'static str] {
        match self {
            CoreEvent::Tick => &["early", "default", "late"],
            CoreEvent::Connect | CoreEvent::Disconnect => &["default"],
        }
    }

    pub fn from_id(id: EventId) -> Option<Self> {
        Self::ALL.into_iter().find(|core| core.id() == id)
    }
}

const FIRST_DYNAMIC_ID: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub reject_duplicate_names: bool,
    /// Attach a profiler to every invocable event.
    pub profiling: bool,
    pub profiler: ProfilerSettings,
    pub error_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            reject_duplicate_names: false,
            profiling: false,
            profiler: ProfilerSettings::default(),
            error_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizeReport {
    pub generation: u64,
    pub finalized: Vec<EventId>,
    pub errors: Vec<RegistrationError>,
}

#[derive(Debug)]
enum EventSlot {
    Building(BuildEvent),
    Invocable(InvocableEvent),
}

/// Owns every event by name and id, and drives the build to invocable
/// transition for each load generation.
pub struct Registry {
    names: HashMap<String, EventId>,
    ids: BTreeMap<EventId, String>,
    slots: BTreeMap<EventId, EventSlot>,
    next_id: u32,
    generation: u64,
    generation_finalized: bool,
    settings: RegistrySettings,
    errors: ScriptErrorLog,
    memory_probe: MemoryProbe,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_settings(RegistrySettings::default())
    }

    pub fn with_settings(settings: RegistrySettings) -> Self {
        let mut registry = Self {
            names: HashMap::new(),
            ids: BTreeMap::new(),
            slots: BTreeMap::new(),
            next_id: FIRST_DYNAMIC_ID,
            generation: 0,
            generation_finalized: false,
            settings,
            errors: ScriptErrorLog::new(settings.error_capacity),
            memory_probe: default_memory_probe,
        };
        for core in CoreEvent::ALL {
            let id = core.id();
            let event = InvocableEvent::new(
                EventIdentity::new(id, ScriptId::NATIVE),
                EventShape::new(core.orders().iter().copied(), []),
                registry.event_settings(),
            );
            registry.names.insert(core.name().to_string(), id);
            registry.ids.insert(id, core.name().to_string());
            registry.slots.insert(id, EventSlot::Invocable(event));
        }
        registry
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn errors(&self) -> &ScriptErrorLog {
        &self.errors
    }

    pub fn set_memory_probe(&mut self, probe: MemoryProbe) {
        self.memory_probe = probe;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_generation_finalized(&self) -> bool {
        self.generation_finalized
    }

    fn event_settings(&self) -> EventSettings {
        EventSettings {
            reject_duplicate_names: self.settings.reject_duplicate_names,
            profiler: self.settings.profiling.then_some(self.settings.profiler),
        }
    }

    // --- ids and names -------------------------------------------------

    pub fn allocate_event_id(&mut self, name: &str, owner: ScriptId) -> Result<EventId, RegistryError> {
        if self.names.contains_key(name) {
            return Err(RegistryError::NameTaken(name.to_string()));
        }
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.names.insert(name.to_string(), id);
        self.ids.insert(id, name.to_string());
        self.slots.insert(id, EventSlot::Building(BuildEvent::new(EventIdentity::new(id, owner))));
        debug!(event = %id, name, script = %owner, "allocated event");
        Ok(id)
    }

    /// Releases both name mappings. The event itself must already be retired.
    pub fn deallocate_event_id(&mut self, id: EventId) -> Result<(), RegistryError> {
        if CoreEvent::from_id(id).is_some() {
            return Err(RegistryError::CoreEvent(id));
        }
        if self.slots.contains_key(&id) {
            return Err(RegistryError::EventStillAlive(id));
        }
        let name = self.ids.remove(&id).ok_or(RegistryError::UnknownEvent(id))?;
        self.names.remove(&name);
        Ok(())
    }

    /// Drops the event behind `id`, whichever stage it is in.
    pub fn retire_event(&mut self, id: EventId) -> Result<(), RegistryError> {
        if CoreEvent::from_id(id).is_some() {
            return Err(RegistryError::CoreEvent(id));
        }
        self.slots.remove(&id).map(|_| ()).ok_or(RegistryError::UnknownEvent(id))
    }

    pub fn get_event_id_by_name(&self, name: &str) -> Option<EventId> {
        self.names.get(name).copied()
    }

    pub fn get_event_name_by_id(&self, id: EventId) -> Option<&str> {
        self.ids.get(&id).map(String::as_str)
    }

    pub fn is_valid_event_id(&self, id: EventId) -> bool {
        self.ids.contains_key(&id)
    }

    pub fn is_invocable(&self, id: EventId) -> bool {
        matches!(self.slots.get(&id), Some(EventSlot::Invocable(_)))
    }

    pub fn is_building(&self, id: EventId) -> bool {
        matches!(self.slots.get(&id), Some(EventSlot::Building(_)))
    }

    fn id_or_allocate(&mut self, name: &str, owner: ScriptId) -> Result<EventId, RegistryError> {
        match self.names.get(name) {
            Some(id) => Ok(*id),
            None => self.allocate_event_id(name, owner),
        }
    }

    // --- declarations and handlers -------------------------------------

    /// Records the shape a script declares for `name`, allocating the event
    /// when this is the first reference to it.
    pub fn declare_event<I, S>(
        &mut self,
        name: &str,
        owner: ScriptId,
        orders: I,
        keys: impl IntoIterator<Item = HandleKey>,
    ) -> Result<EventId, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shape = EventShape::new(orders, keys);
        let id = self.id_or_allocate(name, owner)?;
        match self.slots.get_mut(&id) {
            Some(EventSlot::Building(build)) => match build.declared() {
                Some((existing_owner, existing)) if *existing != shape => {
                    Err(RegistryError::AlreadyDeclared { name: name.to_string(), owner: *existing_owner })
                }
                Some(_) => Ok(id),
                None => {
                    build.declare(owner, shape);
                    Ok(id)
                }
            },
            Some(EventSlot::Invocable(event)) if *event.shape() == shape => Ok(id),
            Some(EventSlot::Invocable(_)) => Err(RegistryError::AlreadyFinalized(id)),
            None => Err(RegistryError::UnknownEvent(id)),
        }
    }

    /// Adds a handler to the event called `name`. Building events queue the
    /// request; invocable events validate and install it immediately.
    pub fn add_handler(&mut self, name: &str, args: AddHandlerArgs) -> Result<EventId, RegistryError> {
        let id = self.id_or_allocate(name, args.script)?;
        self.add_handler_to(id, args)?;
        Ok(id)
    }

    pub fn add_handler_to(&mut self, id: EventId, args: AddHandlerArgs) -> Result<(), RegistryError> {
        match self.slots.get_mut(&id) {
            Some(EventSlot::Building(build)) => {
                build.add(args);
                Ok(())
            }
            Some(EventSlot::Invocable(event)) => Ok(event.add(args)?),
            None => Err(RegistryError::UnknownEvent(id)),
        }
    }

    pub fn override_handler(&mut self, name: &str, target: &str, args: AddHandlerArgs) -> Result<EventId, RegistryError> {
        let id = self.id_or_allocate(name, args.script)?;
        match self.slots.get_mut(&id) {
            Some(EventSlot::Building(build)) => build.override_handler(target, args),
            Some(EventSlot::Invocable(event)) => event.override_handler(target, args)?,
            None => return Err(RegistryError::UnknownEvent(id)),
        }
        Ok(id)
    }

    // --- lifecycle -----------------------------------------------------

    /// Opens a new load generation so the next `on_all_scripts_loaded` can
    /// finalize whatever is still building.
    pub fn begin_load_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation_finalized = false;
        debug!(generation = self.generation, "load generation opened");
        self.generation
    }

    /// Finalizes every build-stage event with its declared shape and installs
    /// the invocable result. Runs once per load generation.
    pub fn on_all_scripts_loaded(&mut self) -> Result<FinalizeReport, RegistryError> {
        if self.generation_finalized {
            return Err(RegistryError::GenerationFinalized(self.generation));
        }
        let building: Vec<EventId> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, EventSlot::Building(_)))
            .map(|(id, _)| *id)
            .collect();
        let settings = self.event_settings();
        let mut report = FinalizeReport { generation: self.generation, ..Default::default() };
        for id in building {
            let Some(EventSlot::Building(mut build)) = self.slots.remove(&id) else {
                continue;
            };
            build.finalize_declared();
            let (event, errors) = build.into_invocable(settings)?;
            for err in &errors {
                warn!(event = %id, script = %err.script(), "rejected handler: {err}");
            }
            report.errors.extend(errors);
            report.finalized.push(id);
            self.slots.insert(id, EventSlot::Invocable(event));
        }
        self.generation_finalized = true;
        info!(
            generation = self.generation,
            finalized = report.finalized.len(),
            rejected = report.errors.len(),
            "scripts loaded; events finalized"
        );
        Ok(report)
    }

    /// Removes handlers (and queued requests) whose script fails the
    /// predicate. Returns the number of installed handlers removed.
    pub fn clear_invalid_handlers(&mut self, is_script_valid: impl Fn(ScriptId) -> bool) -> usize {
        let mut removed = 0;
        for slot in self.slots.values_mut() {
            match slot {
                EventSlot::Building(build) => {
                    build.discard_operations(&is_script_valid);
                }
                EventSlot::Invocable(event) => removed += event.clear_invalid_handlers(&is_script_valid),
            }
        }
        removed
    }

    pub fn on_script_invalidated(&mut self, script: ScriptId) -> usize {
        let removed = self.clear_invalid_handlers(|candidate| candidate != script);
        debug!(script = %script, removed, "script invalidated");
        removed
    }

    pub fn on_script_removed(&mut self, script: ScriptId) -> usize {
        let mut removed = 0;
        for slot in self.slots.values_mut() {
            match slot {
                EventSlot::Building(build) => {
                    build.discard_operations(|candidate| candidate != script);
                }
                EventSlot::Invocable(event) => removed += event.clear_handlers_of(script),
            }
        }
        debug!(script = %script, removed, "script removed");
        removed
    }

    /// Drops every script-owned handler and opens a fresh load generation.
    pub fn on_all_scripts_cleared(&mut self) -> usize {
        let mut removed = 0;
        for slot in self.slots.values_mut() {
            match slot {
                EventSlot::Building(build) => {
                    build.discard_operations(ScriptId::is_native);
                }
                EventSlot::Invocable(event) => removed += event.clear_all_script_handlers(),
            }
        }
        info!(removed, "all script handlers cleared");
        self.begin_load_generation();
        removed
    }

    // --- queries -------------------------------------------------------

    /// Every currently invocable event with its name.
    pub fn events(&self) -> impl Iterator<Item = (&str, &InvocableEvent)> + '_ {
        self.slots.iter().filter_map(move |(id, slot)| match slot {
            EventSlot::Invocable(event) => Some((self.ids.get(id).map(String::as_str).unwrap_or_default(), event)),
            EventSlot::Building(_) => None,
        })
    }

    pub fn event(&self, id: EventId) -> Result<&InvocableEvent, RegistryError> {
        match self.slots.get(&id) {
            Some(EventSlot::Invocable(event)) => Ok(event),
            Some(EventSlot::Building(_)) => Err(RegistryError::NotInvocable(id)),
            None => Err(RegistryError::UnknownEvent(id)),
        }
    }

    pub fn event_mut(&mut self, id: EventId) -> Result<&mut InvocableEvent, RegistryError> {
        match self.slots.get_mut(&id) {
            Some(EventSlot::Invocable(event)) => Ok(event),
            Some(EventSlot::Building(_)) => Err(RegistryError::NotInvocable(id)),
            None => Err(RegistryError::UnknownEvent(id)),
        }
    }

    pub fn build_event(&self, id: EventId) -> Option<&BuildEvent> {
        match self.slots.get(&id) {
            Some(EventSlot::Building(build)) => Some(build),
            _ => None,
        }
    }

    pub fn handler_count(&self, id: EventId) -> Result<usize, RegistryError> {
        match self.slots.get(&id) {
            Some(EventSlot::Invocable(event)) => Ok(event.len()),
            Some(EventSlot::Building(build)) => Ok(build.operations().len()),
            None => Err(RegistryError::UnknownEvent(id)),
        }
    }

    pub fn set_profiling(&mut self, id: EventId, enabled: bool) -> Result<(), RegistryError> {
        let settings = self.settings.profiler;
        self.event_mut(id)?.set_profiler(enabled.then_some(settings));
        Ok(())
    }

    // --- invocation ----------------------------------------------------

    pub fn invoke(
        &mut self,
        id: EventId,
        payload: &Dynamic,
        key: HandleKey,
        options: InvokeOptions,
    ) -> Result<InvocationReport, RegistryError> {
        let probe = self.memory_probe;
        let errors = self.errors.clone();
        Ok(self.event_mut(id)?.invoke(payload, key, options, probe, &errors))
    }

    pub fn invoke_by_name(
        &mut self,
        name: &str,
        payload: &Dynamic,
        key: HandleKey,
        options: InvokeOptions,
    ) -> Result<InvocationReport, RegistryError> {
        let id = self.get_event_id_by_name(name).ok_or_else(|| RegistryError::UnknownEventName(name.to_string()))?;
        self.invoke(id, payload, key, options)
    }

    pub fn prepare_invocation(
        &mut self,
        id: EventId,
        key: HandleKey,
        options: InvokeOptions,
    ) -> Result<Invocation, RegistryError> {
        let probe = self.memory_probe;
        Ok(self.event_mut(id)?.begin_invocation(key, options, probe))
    }

    pub fn finish_invocation(&mut self, invocation: Invocation) {
        match self.event_mut(invocation.event()) {
            Ok(event) => event.end_invocation(invocation),
            Err(err) => debug!(event = %invocation.event(), "invocation finished after event went away: {err}"),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-thread handle to a registry. Invocation releases the borrow while
/// handlers run, so handlers may invoke events or mutate the registry.
#[derive(Clone)]
pub struct SharedRegistry(Rc<RefCell<Registry>>);

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self(Rc::new(RefCell::new(registry)))
    }

    pub fn borrow(&self) -> Ref<'_, Registry> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Registry> {
        self.0.borrow_mut()
    }

    fn try_borrow(&self) -> Result<Ref<'_, Registry>, RegistryError> {
        self.0.try_borrow().map_err(|_| RegistryError::Busy)
    }

    fn try_borrow_mut(&self) -> Result<RefMut<'_, Registry>, RegistryError> {
        self.0.try_borrow_mut().map_err(|_| RegistryError::Busy)
    }

    /// Invokes with the borrow released while handlers run. Fails with
    /// `RegistryError::Busy` when the caller already holds a borrow, as
    /// when a handler reached through `Registry::invoke` calls back in.
    pub fn invoke(
        &self,
        id: EventId,
        payload: &Dynamic,
        key: HandleKey,
        options: InvokeOptions,
    ) -> Result<InvocationReport, RegistryError> {
        let (mut invocation, errors) = {
            let mut registry = self.try_borrow_mut()?;
            let invocation = registry.prepare_invocation(id, key, options)?;
            (invocation, registry.errors().clone())
        };
        let report = invocation.run(payload, &errors);
        match self.try_borrow_mut() {
            Ok(mut registry) => registry.finish_invocation(invocation),
            Err(err) => warn!(event = %invocation.event(), "could not close invocation: {err}"),
        }
        Ok(report)
    }

    pub fn invoke_by_name(
        &self,
        name: &str,
        payload: &Dynamic,
        key: HandleKey,
        options: InvokeOptions,
    ) -> Result<InvocationReport, RegistryError> {
        let id = self
            .try_borrow()?
            .get_event_id_by_name(name)
            .ok_or_else(|| RegistryError::UnknownEventName(name.to_string()))?;
        self.invoke(id, payload, key, options)
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_events_are_invocable_from_the_start() {
        let registry = Registry::new();
        for core in CoreEvent::ALL {
            assert_eq!(registry.get_event_id_by_name(core.name()), Some(core.id()));
            assert!(registry.is_invocable(core.id()));
        }
        assert_eq!(registry.event(CoreEvent::Tick.id()).unwrap().orders().len(), 3);
    }

    #[test]
    fn core_events_cannot_be_retired() {
        let mut registry = Registry::new();
        assert_eq!(registry.retire_event(CoreEvent::Tick.id()), Err(RegistryError::CoreEvent(EventId(1))));
        assert_eq!(registry.deallocate_event_id(CoreEvent::Connect.id()), Err(RegistryError::CoreEvent(EventId(2))));
    }

    #[test]
    fn names_and_ids_map_both_ways() {
        let mut registry = Registry::new();
        let id = registry.allocate_event_id("Msg", ScriptId(1)).unwrap();
        assert_eq!(registry.get_event_name_by_id(id), Some("Msg"));
        assert_eq!(registry.allocate_event_id("Msg", ScriptId(2)), Err(RegistryError::NameTaken("Msg".to_string())));
        assert!(registry.is_building(id));
    }

    #[test]
    fn deallocation_requires_retired_event() {
        let mut registry = Registry::new();
        let id = registry.allocate_event_id("Gone", ScriptId(1)).unwrap();
        assert_eq!(registry.deallocate_event_id(id), Err(RegistryError::EventStillAlive(id)));
        registry.retire_event(id).unwrap();
        registry.deallocate_event_id(id).unwrap();
        assert!(!registry.is_valid_event_id(id));
        assert_eq!(registry.get_event_id_by_name("Gone"), None);
        assert_eq!(registry.deallocate_event_id(id), Err(RegistryError::UnknownEvent(id)));
    }

    #[test]
    fn building_events_cannot_be_invoked() {
        let mut registry = Registry::new();
        let id = registry.allocate_event_id("Late", ScriptId(1)).unwrap();
        let err = registry.invoke(id, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default()).unwrap_err();
        assert_eq!(err, RegistryError::NotInvocable(id));
    }

    #[test]
    fn second_finalize_in_one_generation_is_rejected() {
        let mut registry = Registry::new();
        registry.begin_load_generation();
        registry.on_all_scripts_loaded().unwrap();
        assert_eq!(registry.on_all_scripts_loaded(), Err(RegistryError::GenerationFinalized(1)));
        registry.begin_load_generation();
        assert!(registry.on_all_scripts_loaded().is_ok());
    }

    #[test]
    fn conflicting_declarations_are_rejected() {
        let mut registry = Registry::new();
        registry.declare_event("Msg", ScriptId(1), ["main"], []).unwrap();
        registry.declare_event("Msg", ScriptId(2), ["main"], []).unwrap();
        let err = registry.declare_event("Msg", ScriptId(2), ["other"], []).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyDeclared { name: "Msg".to_string(), owner: ScriptId(1) });
    }

    #[test]
    fn invocable_shape_cannot_change() {
        let mut registry = Registry::new();
        assert!(registry.declare_event("Tick", ScriptId(1), ["early", "default", "late"], []).is_ok());
        assert_eq!(
            registry.declare_event("Tick", ScriptId(1), ["main"], []),
            Err(RegistryError::AlreadyFinalized(CoreEvent::Tick.id()))
        );
    }
}
