use std::cell::{Cell, RefCell};
use std::rc::Rc;

use kestrel_events::events::InvokeOptions;
use kestrel_events::{
    AddHandlerArgs, Callable, CoreEvent, HandleKey, RegistrationError, Registry, RegistryError, RegistrySettings, ScriptId,
    SharedRegistry,
};
use rhai::Dynamic;

type Journal = Rc<RefCell<Vec<String>>>;

fn recorder(journal: &Journal, label: &str) -> AddHandlerArgs {
    let journal = journal.clone();
    let entry = label.to_string();
    AddHandlerArgs::native(move |_, _| journal.borrow_mut().push(entry.clone())).name(label)
}

fn scripted(journal: &Journal, script: u32, label: &str) -> AddHandlerArgs {
    let journal = journal.clone();
    let entry = label.to_string();
    AddHandlerArgs::new(ScriptId(script), Callable::native(move |_, _| journal.borrow_mut().push(entry.clone())))
        .name(label)
}

fn tick(registry: &mut Registry) -> usize {
    registry
        .invoke(CoreEvent::Tick.id(), &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default())
        .expect("invoke tick")
        .called
}

#[test]
fn tick_runs_buckets_then_sequence_then_name() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    registry.add_handler("Tick", recorder(&journal, "A").order("default")).unwrap();
    registry.add_handler("Tick", recorder(&journal, "B").order("early")).unwrap();
    registry.add_handler("Tick", recorder(&journal, "C").order("default").sequence(-1)).unwrap();

    assert_eq!(tick(&mut registry), 3);
    assert_eq!(*journal.borrow(), vec!["B", "C", "A"]);
}

#[test]
fn equal_sequence_breaks_ties_by_name() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    for label in ["zeta", "alpha", "mid"] {
        registry.add_handler("Tick", recorder(&journal, label).order("late")).unwrap();
    }
    tick(&mut registry);
    assert_eq!(*journal.borrow(), vec!["alpha", "mid", "zeta"]);
}

#[test]
fn keyed_invocation_reaches_matching_and_wildcard_handlers() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    let connect = CoreEvent::Connect.id();
    registry.add_handler_to(connect, recorder(&journal, "on-login").key("login")).unwrap();
    registry.add_handler_to(connect, recorder(&journal, "on-logout").key("logout")).unwrap();
    registry.add_handler_to(connect, recorder(&journal, "any")).unwrap();

    let report =
        registry.invoke(connect, &Dynamic::UNIT, HandleKey::from("login"), InvokeOptions::default()).unwrap();
    assert_eq!(report.called, 2);
    assert_eq!(*journal.borrow(), vec!["any", "on-login"]);

    journal.borrow_mut().clear();
    registry.invoke(connect, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default()).unwrap();
    assert_eq!(*journal.borrow(), vec!["any", "on-login", "on-logout"]);
}

#[test]
fn numeric_keys_match_by_value() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    let connect = CoreEvent::Connect.id();
    registry.add_handler_to(connect, recorder(&journal, "seven").key(7_i64)).unwrap();
    registry.invoke(connect, &Dynamic::UNIT, HandleKey::Number(7.0), InvokeOptions::default()).unwrap();
    registry.invoke(connect, &Dynamic::UNIT, HandleKey::from("7"), InvokeOptions::default()).unwrap();
    assert_eq!(*journal.borrow(), vec!["seven"]);
}

#[test]
fn added_handler_invalidates_cached_lists() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    registry.add_handler("Tick", recorder(&journal, "first")).unwrap();
    assert_eq!(tick(&mut registry), 1);
    registry.add_handler("Tick", recorder(&journal, "second")).unwrap();
    assert_eq!(tick(&mut registry), 2);
    registry.on_script_removed(ScriptId::NATIVE);
    assert_eq!(tick(&mut registry), 0);
}

#[test]
fn handler_added_mid_invocation_waits_for_next_call() {
    let registry = SharedRegistry::default();
    let journal: Journal = Rc::default();
    let added = Rc::new(Cell::new(false));
    {
        let shared = registry.clone();
        let journal = journal.clone();
        let added = added.clone();
        let args = AddHandlerArgs::native(move |_, _| {
            journal.borrow_mut().push("adder".to_string());
            if !added.replace(true) {
                let late = journal.clone();
                shared
                    .borrow_mut()
                    .add_handler("Tick", AddHandlerArgs::native(move |_, _| late.borrow_mut().push("late".into())))
                    .expect("add during invocation");
            }
        });
        registry.borrow_mut().add_handler("Tick", args.name("adder")).unwrap();
    }

    let first = registry.invoke(CoreEvent::Tick.id(), &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default());
    assert_eq!(first.unwrap().called, 1);
    let second = registry.invoke(CoreEvent::Tick.id(), &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default());
    assert_eq!(second.unwrap().called, 2);
    assert_eq!(journal.borrow().len(), 3);
}

#[test]
fn build_stage_queues_until_scripts_loaded() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    registry.begin_load_generation();
    let id = registry.declare_event("Spawned", ScriptId(1), ["pre", "main"], []).unwrap();
    registry.add_handler("Spawned", recorder(&journal, "main").order("main")).unwrap();
    registry.add_handler("Spawned", recorder(&journal, "pre").order("pre")).unwrap();

    assert!(registry.is_building(id));
    assert_eq!(registry.handler_count(id), Ok(2));
    assert_eq!(
        registry.invoke(id, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default()),
        Err(RegistryError::NotInvocable(id))
    );

    let report = registry.on_all_scripts_loaded().unwrap();
    assert_eq!(report.finalized, vec![id]);
    assert!(report.errors.is_empty());
    registry.invoke(id, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default()).unwrap();
    assert_eq!(*journal.borrow(), vec!["pre", "main"]);
}

#[test]
fn undeclared_event_finalizes_with_default_bucket() {
    let mut registry = Registry::new();
    registry.begin_load_generation();
    let id = registry.add_handler("Chat", AddHandlerArgs::native(|_, _| {})).unwrap();
    registry.on_all_scripts_loaded().unwrap();
    let event = registry.event(id).unwrap();
    assert_eq!(event.orders(), ["default".to_string()]);
    assert!(event.shape().keys().is_empty());
}

#[test]
fn bad_handlers_are_dropped_at_finalize_with_context() {
    let mut registry = Registry::new();
    registry.begin_load_generation();
    let id = registry.declare_event("Session", ScriptId(2), ["default"], [HandleKey::from("login")]).unwrap();
    let args = AddHandlerArgs::new(ScriptId(3), kestrel_events::Callable::native(|_, _| {}));
    registry.add_handler_to(id, args.clone().order("late").trace("b.rhai")).unwrap();
    registry.add_handler_to(id, args.clone().key("logout").trace("b.rhai")).unwrap();
    registry.add_handler_to(id, args.key("login")).unwrap();

    let report = registry.on_all_scripts_loaded().unwrap();
    assert_eq!(report.errors.len(), 2);
    assert!(matches!(&report.errors[0], RegistrationError::BadOrder { order, .. } if order == "late"));
    assert!(matches!(&report.errors[1], RegistrationError::BadKey { key, .. } if key == &HandleKey::from("logout")));
    assert_eq!(registry.handler_count(id), Ok(1));
}

#[test]
fn invalidated_script_loses_handlers_on_every_event() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    registry.begin_load_generation();
    registry.add_handler("Tick", scripted(&journal, 1, "tick-1")).unwrap();
    registry.add_handler("Tick", scripted(&journal, 2, "tick-2")).unwrap();
    let msg = registry.declare_event("Msg", ScriptId(2), ["main"], []).unwrap();
    registry.add_handler_to(msg, scripted(&journal, 1, "msg-1")).unwrap();
    registry.add_handler_to(msg, scripted(&journal, 2, "msg-2")).unwrap();
    registry.override_handler("Msg", "msg-2", scripted(&journal, 1, "msg-1b")).unwrap();
    assert_eq!(registry.handler_count(msg), Ok(3));

    // Only installed handlers are counted; queued requests are discarded.
    assert_eq!(registry.on_script_invalidated(ScriptId(1)), 1);
    assert_eq!(registry.handler_count(msg), Ok(1));
    assert_eq!(registry.handler_count(CoreEvent::Tick.id()), Ok(1));

    let report = registry.on_all_scripts_loaded().unwrap();
    assert!(report.errors.is_empty());
    tick(&mut registry);
    registry.invoke(msg, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default()).unwrap();
    assert_eq!(*journal.borrow(), vec!["tick-2", "msg-2"]);
}

#[test]
fn clear_invalid_handlers_applies_one_predicate_across_events() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    let connect = CoreEvent::Connect.id();
    for script in 1..=3 {
        registry.add_handler("Tick", scripted(&journal, script, &format!("tick-{script}"))).unwrap();
        registry.add_handler_to(connect, scripted(&journal, script, &format!("connect-{script}"))).unwrap();
    }
    registry.add_handler("Tick", recorder(&journal, "native")).unwrap();

    let removed = registry.clear_invalid_handlers(|script| script.is_native() || script == ScriptId(2));
    assert_eq!(removed, 4);
    tick(&mut registry);
    registry.invoke(connect, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default()).unwrap();
    assert_eq!(*journal.borrow(), vec!["native", "tick-2", "connect-2"]);
}

#[test]
fn events_added_after_finalize_wait_for_next_generation() {
    let mut registry = Registry::new();
    registry.begin_load_generation();
    registry.on_all_scripts_loaded().unwrap();

    let id = registry.add_handler("Late", AddHandlerArgs::native(|_, _| {})).unwrap();
    assert!(registry.is_building(id));
    assert_eq!(registry.on_all_scripts_loaded(), Err(RegistryError::GenerationFinalized(1)));

    assert_eq!(registry.begin_load_generation(), 2);
    registry.on_all_scripts_loaded().unwrap();
    assert!(registry.is_invocable(id));
}

#[test]
fn duplicate_names_rejected_when_configured() {
    let settings = RegistrySettings { reject_duplicate_names: true, ..Default::default() };
    let mut registry = Registry::with_settings(settings);
    registry.add_handler("Tick", AddHandlerArgs::native(|_, _| {}).name("twin")).unwrap();
    let err = registry.add_handler("Tick", AddHandlerArgs::native(|_, _| {}).name("twin")).unwrap_err();
    assert!(matches!(err, RegistryError::Registration(RegistrationError::DuplicateHandlerName { .. })));

    let mut lenient = Registry::new();
    lenient.add_handler("Tick", AddHandlerArgs::native(|_, _| {}).name("twin")).unwrap();
    lenient.add_handler("Tick", AddHandlerArgs::native(|_, _| {}).name("twin")).unwrap();
    assert_eq!(lenient.handler_count(CoreEvent::Tick.id()), Ok(2));
}

#[test]
fn override_replaces_named_handler() {
    let journal: Journal = Rc::default();
    let mut registry = Registry::new();
    registry.add_handler("Tick", recorder(&journal, "greet")).unwrap();
    registry.add_handler("Tick", recorder(&journal, "other")).unwrap();
    let replacement = {
        let journal = journal.clone();
        AddHandlerArgs::native(move |_, _| journal.borrow_mut().push("howdy".into()))
    };
    registry.override_handler("Tick", "greet", replacement).unwrap();
    tick(&mut registry);
    assert_eq!(*journal.borrow(), vec!["howdy", "other"]);
}

#[test]
fn profiler_samples_each_profiled_invocation() {
    let mut registry = Registry::new();
    let id = CoreEvent::Tick.id();
    registry.add_handler_to(id, AddHandlerArgs::native(|_, _| {}).name("noop")).unwrap();
    registry.set_profiling(id, true).unwrap();
    for _ in 0..3 {
        tick(&mut registry);
    }
    registry.invoke(id, &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default() | InvokeOptions::NO_PROFILE).unwrap();

    let profiler = registry.event(id).unwrap().profiler().expect("profiler attached");
    assert_eq!(profiler.summary().samples, 3);
    assert!(!profiler.is_open());

    registry.set_profiling(id, false).unwrap();
    assert!(registry.event(id).unwrap().profiler().is_none());
}

#[test]
fn nested_invocation_of_same_event_is_not_profiled() {
    let registry = SharedRegistry::new(Registry::with_settings(RegistrySettings {
        profiling: true,
        ..Default::default()
    }));
    let depth = Rc::new(Cell::new(0));
    {
        let shared = registry.clone();
        let depth = depth.clone();
        let args = AddHandlerArgs::native(move |_, _| {
            if depth.get() == 0 {
                depth.set(1);
                shared
                    .invoke(CoreEvent::Tick.id(), &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default())
                    .expect("nested invoke");
            }
        });
        registry.borrow_mut().add_handler("Tick", args).unwrap();
    }
    let report = registry.invoke(CoreEvent::Tick.id(), &Dynamic::UNIT, HandleKey::Wildcard, InvokeOptions::default());
    assert_eq!(report.unwrap().called, 1);

    let borrowed = registry.borrow();
    let profiler = borrowed.event(CoreEvent::Tick.id()).unwrap().profiler().expect("profiler");
    assert_eq!(profiler.len(), 1);
    assert!(!profiler.is_open());
}
