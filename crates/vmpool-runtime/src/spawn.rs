//! Runtime spawn function.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use deno_core::v8;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::RuntimeError;
use crate::handle::{RuntimeHandle, Terminator};
use crate::services::RuntimeServices;
use crate::worker::{init_platform, run_worker};

/// Settings for one engine.
#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Heap ceiling in bytes; zero leaves the engine default.
    pub heap_size_limit: usize,
    pub services: RuntimeServices,
}

/// Spawn a runtime on its own thread and wait until the binding template is
/// installed. Blocks the calling thread while the engine boots.
pub fn spawn_runtime(name: String, options: EngineOptions) -> Result<RuntimeHandle, RuntimeError> {
    tracing::debug!(runtime = %name, "spawning runtime");
    init_platform();

    let terminated = Arc::new(AtomicBool::new(false));
    let terminated_clone = terminated.clone();

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The worker hands back the isolate handle once the template is installed
    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<v8::IsolateHandle, String>>(1);

    let name_clone = name.clone();
    let thread_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), RuntimeError> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::SpawnFailed)?;

            let result = rt.block_on(run_worker(
                name_clone.clone(),
                options,
                terminated_clone,
                cmd_rx,
                shutdown_rx,
                init_tx,
            ));

            rt.shutdown_background();
            tracing::debug!(runtime = %name_clone, "runtime thread exiting");
            result
        })?;

    let isolate_handle = match init_rx.recv() {
        Ok(Ok(handle)) => handle,
        Ok(Err(message)) => {
            let _ = thread_handle.join();
            return Err(RuntimeError::JavaScript(message));
        }
        Err(_) => {
            // The thread died before reporting; surface its own error if any
            return match thread_handle.join() {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(RuntimeError::ChannelClosed),
                Err(_) => Err(RuntimeError::ThreadPanic),
            };
        }
    };

    tracing::debug!(runtime = %name, "runtime ready");

    Ok(RuntimeHandle {
        name,
        cmd_tx,
        terminator: Terminator {
            shutdown_tx: Arc::new(shutdown_tx),
            terminated,
            isolate_handle,
        },
        thread_handle: Mutex::new(Some(thread_handle)),
    })
}
