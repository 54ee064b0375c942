use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DispatchConfig;
use crate::events::{EventId, InvokeOptions, ScriptId};
use crate::key::HandleKey;
use crate::profiler::{HandlerTimingSummary, ProfileSummary};
use crate::registry::{Registry, SharedRegistry};
use crate::script_errors::ScriptError;
use crate::scripts::{LoadSummary, ScriptHost};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    /// Script paths, relative to the script root or the fixture's directory.
    pub scripts: Vec<String>,
    #[serde(default)]
    pub steps: Vec<HarnessStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HarnessStep {
    Invoke {
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        key: HandleKey,
        #[serde(default)]
        uncached: bool,
    },
    Reload {
        script: String,
    },
    Unload {
        script: String,
    },
    /// Applies pending watcher changes; needs `scripts.watch` in the config.
    Poll,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub scripts: Vec<ScriptSummary>,
    pub results: Vec<StepResult>,
    pub errors: Vec<ScriptError>,
    pub events: Vec<EventSummary>,
    /// Wall-clock figures; never part of a golden comparison.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timings: Vec<EventTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptSummary {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ScriptId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepResult {
    pub step: usize,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub called: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSummary {
    pub id: EventId,
    pub name: String,
    pub handlers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventTiming {
    pub name: String,
    pub profile: ProfileSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<HandlerTimingSummary>,
}

impl HarnessOutput {
    /// Copy without timing data, for comparing against a golden report.
    pub fn without_timings(&self) -> HarnessOutput {
        HarnessOutput { timings: Vec::new(), ..self.clone() }
    }
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let file = File::open(path.as_ref()).with_context(|| format!("opening fixture '{}'", path.as_ref().display()))?;
    serde_json::from_reader(file).with_context(|| "parsing fixture JSON")
}

/// Loads the fixture's scripts into a fresh registry and replays its steps.
/// Relative script paths resolve against `config.scripts.root`, falling
/// back to `base_dir`.
pub fn run_fixture(fixture: &HarnessFixture, config: &DispatchConfig, base_dir: &Path) -> Result<HarnessOutput> {
    let root = config.scripts.root.clone().unwrap_or_else(|| base_dir.to_path_buf());
    let registry = SharedRegistry::new(Registry::with_settings(config.registry_settings()));
    let mut host = ScriptHost::new(registry.clone());

    let paths: Vec<PathBuf> = fixture.scripts.iter().map(|script| root.join(script)).collect();
    let load = host.load_paths(&paths)?;
    let mut results = vec![load_result(0, "load", &load, host.take_logs())];
    if config.scripts.watch {
        host.watch(&root, config.scripts.poll_interval())?;
    }

    for (idx, step) in fixture.steps.iter().enumerate() {
        let step_no = idx + 1;
        let mut result = match step {
            HarnessStep::Invoke { event, payload, key, uncached } => {
                let payload = rhai::serde::to_dynamic(payload)
                    .map_err(|err| anyhow!("step {step_no}: converting payload for '{event}': {err}"))?;
                let options = if *uncached { InvokeOptions::empty() } else { InvokeOptions::default() };
                let report = registry
                    .invoke_by_name(event, &payload, key.clone(), options)
                    .with_context(|| format!("step {step_no}: invoking '{event}'"))?;
                StepResult {
                    step: step_no,
                    op: format!("invoke {event}"),
                    called: Some(report.called),
                    failed: Some(report.failed),
                    ..Default::default()
                }
            }
            HarnessStep::Reload { script } => {
                let summary = host.reload(root.join(script))?;
                load_result(step_no, &format!("reload {script}"), &summary, Vec::new())
            }
            HarnessStep::Unload { script } => {
                if host.unload(root.join(script)).is_none() {
                    debug!(script = %script, "unload step for a script that is not loaded");
                }
                StepResult { step: step_no, op: format!("unload {script}"), ..Default::default() }
            }
            HarnessStep::Poll => {
                let mut result = StepResult { step: step_no, op: "poll".to_string(), ..Default::default() };
                for summary in host.poll_changes().with_context(|| format!("step {step_no}: applying script changes"))? {
                    result.rejected.extend(load_result(step_no, "poll", &summary, Vec::new()).rejected);
                }
                result
            }
            HarnessStep::Clear => {
                host.clear();
                StepResult { step: step_no, op: "clear".to_string(), ..Default::default() }
            }
        };
        result.logs.extend(host.take_logs());
        results.push(result);
    }

    let scripts = fixture
        .scripts
        .iter()
        .zip(&paths)
        .map(|(script, path)| ScriptSummary { path: script.clone(), id: host.script_id(path) })
        .collect();

    let mut registry = registry.borrow_mut();
    let invocable: Vec<(EventId, String)> =
        registry.events().map(|(name, event)| (event.id(), name.to_string())).collect();
    let mut events = Vec::new();
    let mut timings = Vec::new();
    for (id, name) in invocable {
        let event = registry.event_mut(id)?;
        let handlers = event.sorted_handlers().iter().map(|handler| handler.name().to_string()).collect();
        let profiler = event.profiler();
        if let Some(profiler) = profiler.filter(|profiler| !profiler.is_empty()) {
            timings.push(EventTiming {
                name: name.clone(),
                profile: profiler.summary(),
                handlers: profiler.handler_summaries(),
            });
        }
        events.push(EventSummary { id, name, handlers, samples: profiler.map(|profiler| profiler.len()) });
    }

    Ok(HarnessOutput { scripts, results, errors: registry.errors().snapshot(), events, timings })
}

fn load_result(step: usize, op: &str, summary: &LoadSummary, logs: Vec<String>) -> StepResult {
    let mut rejected: Vec<String> = summary.rejected.iter().map(ToString::to_string).collect();
    rejected.extend(summary.failed.iter().map(|(path, err)| format!("{}: {err}", path.display())));
    StepResult { step, op: op.to_string(), logs, called: None, failed: None, rejected }
}
