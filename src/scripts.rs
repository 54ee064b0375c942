use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, Map, Scope, AST, INT};
use tracing::{debug, info, warn};

use crate::error::{RegistrationError, RegistryError};
use crate::events::{EventId, InvokeOptions, ScriptId};
use crate::handler::{AddHandlerArgs, Callable, ScriptCallable};
use crate::key::HandleKey;
use crate::registry::SharedRegistry;
use crate::script_errors::ScriptError;
use crate::script_watch::{normalize_watch_path, ScriptChange, ScriptChangeKind, ScriptWatcher};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// A compiled script together with the engine that runs its functions.
pub struct ScriptModule {
    path: PathBuf,
    engine: Rc<Engine>,
    ast: AST,
}

impl ScriptModule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    /// Parameters `function` still expects once its captured values are
    /// curried in. Unknown functions are assumed to take the payload only.
    pub fn arity(&self, function: &FnPtr) -> usize {
        let curried = function.curry().len();
        self.ast
            .iter_functions()
            .find(|meta| meta.name == function.fn_name())
            .map(|meta| meta.params.len().saturating_sub(curried))
            .unwrap_or(1)
    }
}

#[derive(Default)]
struct HandlerOptions {
    order: Option<String>,
    key: HandleKey,
    sequence: i64,
    name: Option<String>,
}

impl HandlerOptions {
    fn parse(map: Map) -> ScriptResult<Self> {
        let mut options = HandlerOptions::default();
        for (field, value) in map {
            match field.as_str() {
                "order" => options.order = Some(expect_string("order", value)?),
                "name" => options.name = Some(expect_string("name", value)?),
                "key" => {
                    options.key = HandleKey::from_dynamic(&value)
                        .ok_or_else(|| format!("handler key must be a number or string, found {}", value.type_name()))?
                }
                "seq" | "sequence" => {
                    options.sequence =
                        value.as_int().map_err(|ty| format!("handler sequence must be an integer, found {ty}"))?
                }
                other => return Err(format!("unknown handler option '{other}'").into()),
            }
        }
        Ok(options)
    }

    fn into_args(self, script: ScriptId, callable: Callable, trace: &str) -> AddHandlerArgs {
        AddHandlerArgs {
            script,
            callable,
            order: self.order,
            key: self.key,
            sequence: self.sequence,
            name: self.name,
            trace: trace.to_string(),
        }
    }
}

enum Declaration {
    Event { name: String, orders: Vec<String>, keys: Vec<HandleKey> },
    Handler { event: String, options: HandlerOptions, function: FnPtr },
    Override { event: String, target: String, options: HandlerOptions, function: FnPtr },
}

struct HostState {
    registry: SharedRegistry,
    loading: RefCell<Option<Vec<Declaration>>>,
    logs: RefCell<Vec<String>>,
}

impl HostState {
    fn queue(&self, declaration: Declaration) -> ScriptResult<()> {
        match self.loading.borrow_mut().as_mut() {
            Some(pending) => {
                pending.push(declaration);
                Ok(())
            }
            None => Err("events can only be declared from the top level of a loading script".into()),
        }
    }

    fn log(&self, message: &str) {
        info!(target: "kestrel_events::script", "{message}");
        self.logs.borrow_mut().push(message.to_string());
    }
}

fn upgrade(state: &Weak<HostState>) -> ScriptResult<Rc<HostState>> {
    state.upgrade().ok_or_else(|| "script host has shut down".into())
}

fn expect_string(field: &str, value: Dynamic) -> ScriptResult<String> {
    value.into_string().map_err(|ty| format!("{field} must be a string, found {ty}").into())
}

fn strings(values: Array) -> ScriptResult<Vec<String>> {
    values.into_iter().map(|value| expect_string("order", value)).collect()
}

fn keys(values: Array) -> ScriptResult<Vec<HandleKey>> {
    let mut out = Vec::with_capacity(values.len());
    for value in &values {
        match HandleKey::from_dynamic(value) {
            Some(key) => out.push(key),
            None => return Err(format!("event key must be a number or string, found {}", value.type_name()).into()),
        }
    }
    Ok(out)
}

/// Handlers reached from here belong to other scripts, so the loading
/// script's declaration queue is closed to them until the call returns.
fn invoke_from_script(state: &Weak<HostState>, name: &str, payload: Dynamic, key: HandleKey) -> ScriptResult<INT> {
    let state = upgrade(state)?;
    let registry = state.registry.clone();
    let suspended = state.loading.borrow_mut().take();
    let result = registry.invoke_by_name(name, &payload, key, InvokeOptions::default());
    *state.loading.borrow_mut() = suspended;
    result.map(|report| report.called as INT).map_err(|err| err.to_string().into())
}

fn register_api(engine: &mut Engine, state: &Weak<HostState>) {
    let s = state.clone();
    engine.register_fn("declare_event", move |name: &str, orders: Array| -> ScriptResult<()> {
        upgrade(&s)?.queue(Declaration::Event { name: name.to_string(), orders: strings(orders)?, keys: Vec::new() })
    });
    let s = state.clone();
    engine.register_fn("declare_event", move |name: &str, orders: Array, event_keys: Array| -> ScriptResult<()> {
        upgrade(&s)?.queue(Declaration::Event {
            name: name.to_string(),
            orders: strings(orders)?,
            keys: keys(event_keys)?,
        })
    });
    let s = state.clone();
    engine.register_fn("on_event", move |event: &str, function: FnPtr| -> ScriptResult<()> {
        upgrade(&s)?.queue(Declaration::Handler {
            event: event.to_string(),
            options: HandlerOptions::default(),
            function,
        })
    });
    let s = state.clone();
    engine.register_fn("on_event", move |event: &str, options: Map, function: FnPtr| -> ScriptResult<()> {
        upgrade(&s)?.queue(Declaration::Handler {
            event: event.to_string(),
            options: HandlerOptions::parse(options)?,
            function,
        })
    });
    let s = state.clone();
    engine.register_fn("override_handler", move |event: &str, target: &str, function: FnPtr| -> ScriptResult<()> {
        upgrade(&s)?.queue(Declaration::Override {
            event: event.to_string(),
            target: target.to_string(),
            options: HandlerOptions::default(),
            function,
        })
    });
    let s = state.clone();
    engine.register_fn("invoke_event", move |name: &str, payload: Dynamic| -> ScriptResult<INT> {
        invoke_from_script(&s, name, payload, HandleKey::Wildcard)
    });
    let s = state.clone();
    engine.register_fn("invoke_event", move |name: &str, payload: Dynamic, key: Dynamic| -> ScriptResult<INT> {
        let key = HandleKey::from_dynamic(&key)
            .ok_or_else(|| format!("event key must be a number or string, found {}", key.type_name()))?;
        invoke_from_script(&s, name, payload, key)
    });
    let s = state.clone();
    engine.register_fn("log", move |message: &str| -> ScriptResult<()> {
        upgrade(&s)?.log(message);
        Ok(())
    });
    let s = state.clone();
    engine.on_print(move |text| {
        if let Some(state) = s.upgrade() {
            state.log(text);
        }
    });
}

struct LoadedScript {
    id: ScriptId,
    module: Rc<ScriptModule>,
}

/// Outcome of loading one or more scripts and finalizing the generation.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub generation: u64,
    pub loaded: Vec<ScriptId>,
    pub failed: Vec<(PathBuf, String)>,
    pub rejected: Vec<RegistryError>,
    pub finalized: Vec<EventId>,
}

impl LoadSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rejected.is_empty()
    }
}

/// Loads rhai scripts and turns their declarations into registry calls.
///
/// Each script's top level may use `declare_event`, `on_event`,
/// `override_handler`, `invoke_event` and `log`. Handlers may call
/// `invoke_event` while running.
pub struct ScriptHost {
    engine: Rc<Engine>,
    state: Rc<HostState>,
    scripts: BTreeMap<PathBuf, LoadedScript>,
    script_ids: HashMap<PathBuf, ScriptId>,
    next_script: u32,
    watcher: Option<ScriptWatcher>,
}

impl ScriptHost {
    pub fn new(registry: SharedRegistry) -> Self {
        let state = Rc::new(HostState { registry, loading: RefCell::new(None), logs: RefCell::new(Vec::new()) });
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        register_api(&mut engine, &Rc::downgrade(&state));
        Self {
            engine: Rc::new(engine),
            state,
            scripts: BTreeMap::new(),
            script_ids: HashMap::new(),
            next_script: 1,
            watcher: None,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.state.registry
    }

    /// Ids stay stable across reloads of the same path.
    pub fn script_id(&self, path: impl AsRef<Path>) -> Option<ScriptId> {
        self.script_ids.get(path.as_ref()).copied()
    }

    pub fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.scripts.contains_key(path.as_ref())
    }

    pub fn loaded_scripts(&self) -> impl Iterator<Item = (&Path, ScriptId)> {
        self.scripts.iter().map(|(path, script)| (path.as_path(), script.id))
    }

    pub fn module(&self, path: impl AsRef<Path>) -> Option<Rc<ScriptModule>> {
        self.scripts.get(path.as_ref()).map(|script| script.module.clone())
    }

    pub fn take_logs(&self) -> Vec<String> {
        std::mem::take(&mut *self.state.logs.borrow_mut())
    }

    fn id_for(&mut self, path: &Path) -> ScriptId {
        if let Some(id) = self.script_ids.get(path) {
            return *id;
        }
        let id = ScriptId(self.next_script);
        self.next_script += 1;
        self.script_ids.insert(path.to_path_buf(), id);
        id
    }

    /// Loads every `.rhai` file under `root` (sorted by path) as one load
    /// generation and finalizes it.
    pub fn load_all(&mut self, root: impl AsRef<Path>) -> Result<LoadSummary> {
        let paths = script_paths(root.as_ref())?;
        self.load_paths(&paths)
    }

    pub fn load_paths(&mut self, paths: &[PathBuf]) -> Result<LoadSummary> {
        let mut summary = LoadSummary { generation: self.registry().borrow_mut().begin_load_generation(), ..Default::default() };
        for path in paths {
            self.load_into(path, &mut summary);
        }
        self.finalize(&mut summary)?;
        Ok(summary)
    }

    /// Drops the script's handlers, runs it again and finalizes a fresh
    /// generation so events it introduces become invocable.
    pub fn reload(&mut self, path: impl AsRef<Path>) -> Result<LoadSummary> {
        let path = path.as_ref();
        if let Some(id) = self.script_id(path) {
            self.registry().borrow_mut().on_script_removed(id);
        }
        self.scripts.remove(path);
        let mut summary = LoadSummary { generation: self.registry().borrow_mut().begin_load_generation(), ..Default::default() };
        self.load_into(path, &mut summary);
        self.finalize(&mut summary)?;
        info!(path = %path.display(), clean = summary.is_clean(), "script reloaded");
        Ok(summary)
    }

    pub fn unload(&mut self, path: impl AsRef<Path>) -> Option<ScriptId> {
        let script = self.scripts.remove(path.as_ref())?;
        let removed = self.registry().borrow_mut().on_script_removed(script.id);
        debug!(path = %path.as_ref().display(), removed, "script unloaded");
        Some(script.id)
    }

    pub fn clear(&mut self) {
        self.registry().borrow_mut().on_all_scripts_cleared();
        self.scripts.clear();
    }

    /// Starts watching `root` for script edits. Nothing is applied until
    /// `poll_changes` runs.
    pub fn watch(&mut self, root: impl AsRef<Path>, poll_interval: Duration) -> Result<()> {
        if self.watcher.is_none() {
            self.watcher = Some(ScriptWatcher::new(poll_interval)?);
        }
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.watch_root(root.as_ref())?;
        }
        info!(root = %root.as_ref().display(), "watching scripts");
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Drains the watcher and applies what it saw. A no-op when not watching.
    pub fn poll_changes(&mut self) -> Result<Vec<LoadSummary>> {
        let changes = match self.watcher.as_mut() {
            Some(watcher) => watcher.drain_changes(),
            None => return Ok(Vec::new()),
        };
        if !changes.is_empty() {
            debug!(changes = changes.len(), "applying script changes");
        }
        self.apply_changes(&changes)
    }

    /// Applies watcher notifications on the dispatch thread. Paths are
    /// matched against loaded scripts after resolving symlinks, so a
    /// canonical watcher path reaches a script loaded through a relative one.
    pub fn apply_changes(&mut self, changes: &[ScriptChange]) -> Result<Vec<LoadSummary>> {
        let mut summaries = Vec::new();
        for change in changes {
            let path = self.loaded_path_for(&change.path);
            match change.kind {
                ScriptChangeKind::Modified => summaries.push(self.reload(&path)?),
                ScriptChangeKind::Removed => {
                    self.unload(&path);
                }
            }
        }
        Ok(summaries)
    }

    fn loaded_path_for(&self, path: &Path) -> PathBuf {
        if self.scripts.contains_key(path) {
            return path.to_path_buf();
        }
        let wanted = normalize_watch_path(path);
        self.scripts
            .keys()
            .find(|loaded| normalize_watch_path(loaded) == wanted)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf())
    }

    fn load_into(&mut self, path: &Path, summary: &mut LoadSummary) {
        let id = self.id_for(path);
        match self.load_script(path, id) {
            Ok(rejected) => {
                summary.loaded.push(id);
                summary.rejected.extend(rejected);
            }
            Err(err) => {
                warn!(path = %path.display(), script = %id, "script failed to load: {err:#}");
                self.registry().borrow().errors().report(ScriptError {
                    script: id,
                    event: None,
                    handler: None,
                    message: format!("{err:#}"),
                });
                summary.failed.push((path.to_path_buf(), format!("{err:#}")));
            }
        }
    }

    /// Compiles and runs one script, then applies what it declared. Returns
    /// the declarations the registry rejected right away.
    fn load_script(&mut self, path: &Path, id: ScriptId) -> Result<Vec<RegistryError>> {
        let source = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let ast = self.engine.compile(source).map_err(|err| anyhow!("Compiling {}: {err}", path.display()))?;
        let module = Rc::new(ScriptModule { path: path.to_path_buf(), engine: self.engine.clone(), ast });

        *self.state.loading.borrow_mut() = Some(Vec::new());
        let mut scope = Scope::new();
        let run = self.engine.run_ast_with_scope(&mut scope, module.ast());
        let declarations = self.state.loading.borrow_mut().take().unwrap_or_default();
        run.map_err(|err| anyhow!("Running {}: {err}", path.display()))?;

        let rejected = self.apply_declarations(id, &module, declarations);
        self.scripts.insert(path.to_path_buf(), LoadedScript { id, module });
        Ok(rejected)
    }

    fn apply_declarations(
        &self,
        id: ScriptId,
        module: &Rc<ScriptModule>,
        declarations: Vec<Declaration>,
    ) -> Vec<RegistryError> {
        let trace = module.path().display().to_string();
        let mut registry = self.registry().borrow_mut();
        let mut rejected = Vec::new();
        for declaration in declarations {
            let result = match declaration {
                Declaration::Event { name, orders, keys } => registry.declare_event(&name, id, orders, keys).map(|_| ()),
                Declaration::Handler { event, options, function } => {
                    let callable = Callable::Script(ScriptCallable::new(module.clone(), function));
                    registry.add_handler(&event, options.into_args(id, callable, &trace)).map(|_| ())
                }
                Declaration::Override { event, target, options, function } => {
                    let callable = Callable::Script(ScriptCallable::new(module.clone(), function));
                    registry.override_handler(&event, &target, options.into_args(id, callable, &trace)).map(|_| ())
                }
            };
            if let Err(err) = result {
                warn!(script = %id, "declaration rejected: {err}");
                registry.errors().report(ScriptError { script: id, event: None, handler: None, message: err.to_string() });
                rejected.push(err);
            }
        }
        rejected
    }

    fn finalize(&self, summary: &mut LoadSummary) -> Result<()> {
        let mut registry = self.registry().borrow_mut();
        let report = registry.on_all_scripts_loaded()?;
        for err in &report.errors {
            registry.errors().report(registration_failure(err));
        }
        summary.finalized = report.finalized;
        summary.rejected.extend(report.errors.into_iter().map(RegistryError::from));
        Ok(())
    }
}

fn registration_failure(err: &RegistrationError) -> ScriptError {
    ScriptError { script: err.script(), event: Some(err.event()), handler: None, message: err.to_string() }
}

/// `.rhai` files directly under `root`, sorted so load order is stable.
pub fn script_paths(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Listing scripts in {}", root.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "rhai") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
