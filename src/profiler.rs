use crate::error::ProfilerError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Reads the host's current memory usage in bytes.
pub type MemoryProbe = fn() -> u64;

/// Live heap bytes when the tracking allocator is compiled in, zero otherwise.
pub fn default_memory_probe() -> u64 {
    #[cfg(feature = "alloc_profiler")]
    {
        crate::alloc_profiler::live_bytes()
    }
    #[cfg(not(feature = "alloc_profiler"))]
    {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerSettings {
    pub capacity: usize,
    pub trace_handlers: bool,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self { capacity: 120, trace_handlers: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerSample {
    pub duration: Duration,
    pub memory_delta: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileSample {
    pub duration: Duration,
    pub memory_delta: i64,
    pub handlers: Option<HashMap<String, HandlerSample>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub samples: usize,
    pub last_ms: f32,
    pub average_ms: f32,
    pub max_ms: f32,
    pub memory_delta: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerTimingSummary {
    pub name: String,
    pub calls: usize,
    pub total_ms: f32,
    pub max_ms: f32,
    pub memory_delta: i64,
}

/// Fixed-capacity ring of per-invocation samples for one event.
#[derive(Debug)]
pub struct Profiler {
    scope_depth: u32,
    open: Option<(Instant, u64)>,
    capacity: usize,
    trace_handlers: bool,
    samples: VecDeque<ProfileSample>,
}

impl Profiler {
    pub fn new(settings: ProfilerSettings) -> Self {
        let capacity = settings.capacity.max(1);
        Self {
            scope_depth: 0,
            open: None,
            capacity,
            trace_handlers: settings.trace_handlers,
            samples: VecDeque::with_capacity(capacity.min(1_024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn trace_handlers(&self) -> bool {
        self.trace_handlers
    }

    pub fn set_trace_handlers(&mut self, enabled: bool) {
        self.trace_handlers = enabled;
    }

    pub fn is_open(&self) -> bool {
        self.scope_depth > 0
    }

    pub fn begin_event(&mut self, memory: u64) -> Result<(), ProfilerError> {
        if self.scope_depth != 0 {
            return Err(ProfilerError::NestedScope);
        }
        self.scope_depth = 1;
        self.open = Some((Instant::now(), memory));
        Ok(())
    }

    /// Closes the open scope and pushes one sample, evicting the oldest
    /// sample once the ring is full.
    pub fn end_event(
        &mut self,
        memory: u64,
        handlers: Option<HashMap<String, HandlerSample>>,
    ) -> Result<(), ProfilerError> {
        if self.scope_depth != 1 {
            return Err(ProfilerError::NoOpenScope);
        }
        let Some((start, start_memory)) = self.open.take() else {
            return Err(ProfilerError::NoOpenScope);
        };
        self.scope_depth = 0;
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ProfileSample {
            duration: start.elapsed(),
            memory_delta: memory_delta(start_memory, memory),
            handlers,
        });
        Ok(())
    }

    pub fn samples(&self) -> impl Iterator<Item = &ProfileSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn summary(&self) -> ProfileSummary {
        let mut summary = ProfileSummary { samples: self.samples.len(), ..Default::default() };
        let mut total_ms = 0.0;
        for sample in &self.samples {
            let ms = as_ms(sample.duration);
            total_ms += ms;
            summary.max_ms = summary.max_ms.max(ms);
            summary.memory_delta += sample.memory_delta;
        }
        if let Some(last) = self.samples.back() {
            summary.last_ms = as_ms(last.duration);
        }
        if summary.samples > 0 {
            summary.average_ms = total_ms / summary.samples as f32;
        }
        summary
    }

    pub fn handler_summaries(&self) -> Vec<HandlerTimingSummary> {
        let mut by_name: HashMap<&str, HandlerTimingSummary> = HashMap::new();
        for handlers in self.samples.iter().filter_map(|sample| sample.handlers.as_ref()) {
            for (name, sample) in handlers {
                let entry = by_name.entry(name.as_str()).or_insert_with(|| HandlerTimingSummary {
                    name: name.clone(),
                    calls: 0,
                    total_ms: 0.0,
                    max_ms: 0.0,
                    memory_delta: 0,
                });
                let ms = as_ms(sample.duration);
                entry.calls += 1;
                entry.total_ms += ms;
                entry.max_ms = entry.max_ms.max(ms);
                entry.memory_delta += sample.memory_delta;
            }
        }
        let mut out: Vec<_> = by_name.into_values().collect();
        out.sort_by(|a, b| {
            b.total_ms.partial_cmp(&a.total_ms).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

pub(crate) fn memory_delta(before: u64, after: u64) -> i64 {
    after as i64 - before as i64
}

fn as_ms(duration: Duration) -> f32 {
    duration.as_secs_f32() * 1000.0
}
