//! Host capabilities reachable from JavaScript.
//!
//! Every runtime gets a clone of [`RuntimeServices`] in its `OpState`. Ops look
//! up the collaborator they need and report a `NotAvailable` error to the
//! script when the host did not provide one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vmpool_fs::FsRegistry;

use crate::error::CapabilityError;
use crate::types::{HttpRequest, HttpResponse};

/// Services that can be accessed from JavaScript.
#[derive(Clone, Default)]
pub struct RuntimeServices {
    /// Filesystem backends for the `FS` binding
    pub filesystems: Arc<FsRegistry>,
    /// Application data root; the `http` binding resolves attachments here
    pub data_root: PathBuf,
    pub http: Option<Arc<dyn HttpClient>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub query: Option<Arc<dyn QueryEngine>>,
    pub jobs: Option<Arc<dyn JobDispatcher>>,
    pub messaging: Option<Arc<dyn MessageBus>>,
    pub translator: Option<Arc<dyn Translator>>,
    pub processes: Option<Arc<dyn ProcessRegistry>>,
    /// Host application API surface (`Studio`)
    pub host: Option<Arc<dyn HostApi>>,
    /// Source of modules for `Require`
    pub modules: Option<Arc<dyn ModuleSource>>,
}

/// Outgoing HTTP.
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError>;
}

/// Named key-value stores.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, store: &str, key: &str) -> Result<Option<serde_json::Value>, CapabilityError>;

    async fn set(
        &self,
        store: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CapabilityError>;

    async fn has(&self, store: &str, key: &str) -> Result<bool, CapabilityError>;

    async fn del(&self, store: &str, key: &str) -> Result<(), CapabilityError>;

    async fn keys(&self, store: &str) -> Result<Vec<String>, CapabilityError>;
}

/// Query execution against a named engine.
#[async_trait::async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    async fn run(&self, engine: &str, dsl: serde_json::Value)
        -> Result<serde_json::Value, CapabilityError>;
}

/// Background job dispatch. Returns the job ID.
pub trait JobDispatcher: Send + Sync + 'static {
    fn dispatch(&self, name: &str, payload: serde_json::Value) -> Result<String, CapabilityError>;
}

/// Real-time messaging.
pub trait MessageBus: Send + Sync + 'static {
    fn publish(&self, channel: &str, message: serde_json::Value) -> Result<(), CapabilityError>;
}

/// Localization lookup. Unknown keys come back unchanged.
pub trait Translator: Send + Sync + 'static {
    fn translate(&self, key: &str, locale: Option<&str>) -> String;
}

/// Host processes callable by name.
#[async_trait::async_trait]
pub trait ProcessRegistry: Send + Sync + 'static {
    async fn call(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CapabilityError>;
}

/// Host application API, same calling convention as processes.
#[async_trait::async_trait]
pub trait HostApi: Send + Sync + 'static {
    async fn call(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CapabilityError>;
}

/// Module sources for `Require`.
pub trait ModuleSource: Send + Sync + 'static {
    fn load(&self, name: &str) -> Result<String, CapabilityError>;
}

/// Name of the runtime, kept in `OpState` for log attribution.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeName(pub String);
