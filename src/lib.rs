#[cfg(feature = "alloc_profiler")]
pub mod alloc_profiler;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod key;
pub mod profiler;
pub mod registry;
pub mod script_errors;
pub mod script_harness;
pub mod script_watch;
pub mod scripts;

pub use error::{CallError, ProfilerError, RegistrationError, RegistryError};
pub use events::{EventId, EventShape, InvocationReport, InvokeOptions, ScriptId};
pub use handler::{AddHandlerArgs, Callable, Handler};
pub use key::HandleKey;
pub use registry::{CoreEvent, Registry, RegistrySettings, SharedRegistry};
pub use scripts::ScriptHost;
