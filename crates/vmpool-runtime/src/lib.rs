//! JavaScript engine threads for the VM pool.
//!
//! Each runtime runs in its own OS thread with its own V8 isolate and a
//! current-thread Tokio runtime. The host talks to it through a
//! [`RuntimeHandle`]: commands go over a channel and replies come back on
//! oneshot channels.
//!
//! # Architecture
//!
//! - The binding template runs once per runtime in the host context; every
//!   execution context is a separate V8 context that gets a fresh set of the
//!   [`BINDING_NAMES`] globals
//! - Host collaborators ([`RuntimeServices`]) live in `OpState`; ops call them directly
//! - Execution contexts are created, called and closed by id
//! - Compiled scripts are cached per file name and bound to each new context

mod command;
mod error;
mod handle;
mod ops;
mod services;
mod spawn;
mod template;
mod types;
mod worker;

pub use error::{CapabilityError, RuntimeError};
pub use handle::{RuntimeHandle, Terminator};
pub use ops::vm_bindings;
pub use services::{
    HostApi, HttpClient, JobDispatcher, KeyValueStore, MessageBus, ModuleSource, ProcessRegistry,
    QueryEngine, RuntimeServices, Translator,
};
pub use spawn::{spawn_runtime, EngineOptions};
pub use template::BINDING_NAMES;
pub use types::{ContextId, FsCall, HeapStatistics, HttpRequest, HttpResponse, StoreCall};
pub use worker::init_platform;
