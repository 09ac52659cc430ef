//! Pool of V8 VM instances.
//!
//! A [`VmPool`] keeps a bounded, elastic set of engines. Callers take one with
//! [`VmPool::select_instance`], bind a [`Script`] to it through
//! [`VmInstance::make_context`], and hand it back with [`VmPool::release`],
//! which requeues healthy instances and retires the rest.
//!
//! ```ignore
//! let pool = VmPool::new(PoolConfig::default(), RuntimeServices::default(), scripts);
//! pool.start().await?;
//!
//! let instance = pool.select_instance(Duration::from_secs(1)).await?;
//! let context = instance.make_context(&script).await?;
//! let result = context.call("main", vec![]).await?;
//! context.close().await?;
//! pool.release(instance).await;
//! ```

mod config;
mod context;
mod error;
mod instance;
mod pool;
mod queue;
mod script;

pub use config::{PoolConfig, MAX_POOL_SIZE, ROOT_SCRIPT_TIMEOUT};
pub use context::ExecutionContext;
pub use error::{ConfigError, PoolError};
pub use instance::{HealthPolicy, InstanceId, InstanceOptions, Status, VmInstance};
pub use pool::{PoolStats, VmPool};
pub use script::{Script, ScriptRegistry};

pub use vmpool_fs as fs;
pub use vmpool_runtime as runtime;
