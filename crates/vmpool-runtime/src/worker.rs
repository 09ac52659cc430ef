//! Worker thread implementation for the JavaScript runtime.
//!
//! This module contains the loop that runs in a dedicated thread for each
//! runtime, handling commands and managing the V8 isolate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Once;

use deno_core::serde_v8;
use deno_core::v8;
use deno_core::JsRuntime;
use deno_core::PollEventLoopOptions;
use deno_core::RuntimeOptions;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::command::RuntimeCommand;
use crate::error::RuntimeError;
use crate::ops::vm_bindings;
use crate::services::RuntimeName;
use crate::spawn::EngineOptions;
use crate::template::{self, Hooks};
use crate::types::{ContextId, HeapStatistics};

/// Ensure V8 platform is initialized exactly once.
static V8_INIT: Once = Once::new();

/// Serializes isolate creation; concurrent creation can crash V8.
pub(crate) static ISOLATE_CREATE_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Headroom granted when an isolate reaches its heap limit, enough for the
/// terminated script to unwind.
const HEAP_LIMIT_BUMP: usize = 16 * 1024 * 1024;

/// Initialize the V8 platform. Call this before spawning any runtimes.
/// Safe to call multiple times - will only initialize once.
pub fn init_platform() {
    V8_INIT.call_once(|| {
        JsRuntime::init_platform(None, false);
    });
}

/// The main worker loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    name: String,
    options: EngineOptions,
    terminated: Arc<AtomicBool>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    init_tx: std::sync::mpsc::SyncSender<Result<v8::IsolateHandle, String>>,
) -> Result<(), RuntimeError> {
    let create_params = (options.heap_size_limit > 0)
        .then(|| v8::CreateParams::default().heap_limits(0, options.heap_size_limit));

    let mut js_runtime = {
        let _lock = ISOLATE_CREATE_LOCK.lock();
        tracing::debug!(runtime = %name, "creating JsRuntime");
        JsRuntime::new(RuntimeOptions {
            extensions: vec![vm_bindings::init_ops()],
            create_params,
            ..Default::default()
        })
    };

    let isolate_handle = js_runtime.v8_isolate().thread_safe_handle();

    // Terminate the running script instead of letting V8 abort the process
    let exhausted = Arc::new(AtomicBool::new(false));
    {
        let exhausted = exhausted.clone();
        let isolate_handle = isolate_handle.clone();
        let name = name.clone();
        js_runtime.add_near_heap_limit_callback(move |current, initial| {
            tracing::warn!(runtime = %name, current, initial, "heap limit reached, terminating script");
            exhausted.store(true, Ordering::SeqCst);
            isolate_handle.terminate_execution();
            current + HEAP_LIMIT_BUMP
        });
    }

    {
        let op_state = js_runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(options.services);
        state.put(RuntimeName(name.clone()));
    }

    // Declared after the runtime so its V8 handles drop before the isolate
    let mut engine = match template::install(&mut js_runtime) {
        Ok(hooks) => Engine::new(hooks),
        Err(e) => {
            let _ = init_tx.send(Err(e.to_string()));
            return Err(e);
        }
    };

    let _ = init_tx.send(Ok(isolate_handle));

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            tracing::debug!(runtime = %name, "shutdown signal received");
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!(runtime = %name, "command channel closed");
                    break;
                };
                handle_command(&mut js_runtime, &mut engine, cmd, &exhausted).await;

                // Let the next command run after a heap-limit termination
                if exhausted.load(Ordering::SeqCst) && !terminated.load(Ordering::SeqCst) {
                    js_runtime.v8_isolate().cancel_terminate_execution();
                }
            }
        }
    }

    tracing::debug!(runtime = %name, contexts = engine.contexts.len(), "worker finished");
    Ok(())
}

/// Execution contexts and compiled scripts owned by one runtime.
struct Engine {
    hooks: Hooks,
    contexts: HashMap<ContextId, LiveContext>,
    /// Compiled scripts by file name, bound again for every new context.
    compiled: HashMap<String, CompiledScript>,
    next_context: ContextId,
}

struct LiveContext {
    script: String,
    context: v8::Global<v8::Context>,
}

struct CompiledScript {
    source: String,
    script: v8::Global<v8::UnboundScript>,
}

impl Engine {
    fn new(hooks: Hooks) -> Self {
        Self {
            hooks,
            contexts: HashMap::new(),
            compiled: HashMap::new(),
            next_context: 1,
        }
    }

    /// Compile `source` once per file name. A changed source replaces the
    /// cached entry.
    fn compile<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
        source: &str,
    ) -> Result<v8::Local<'s, v8::UnboundScript>, String> {
        if let Some(compiled) = self.compiled.get(name) {
            if compiled.source == source {
                return Ok(v8::Local::new(scope, &compiled.script));
            }
        }

        let code = format!("{}\n//# sourceURL={}", source, name);
        let code = v8::String::new(scope, &code)
            .ok_or_else(|| "script source is too large".to_string())?;
        let mut code = v8::script_compiler::Source::new(code, None);

        let tc = &mut v8::TryCatch::new(scope);
        let Some(script) = v8::script_compiler::compile_unbound_script(
            tc,
            &mut code,
            v8::script_compiler::CompileOptions::NoCompileOptions,
            v8::script_compiler::NoCacheReason::NoReason,
        ) else {
            return Err(template::exception_message(tc));
        };

        self.compiled.insert(
            name.to_string(),
            CompiledScript {
                source: source.to_string(),
                script: v8::Global::new(tc, script),
            },
        );
        Ok(script)
    }
}

async fn handle_command(
    js_runtime: &mut JsRuntime,
    engine: &mut Engine,
    cmd: RuntimeCommand,
    exhausted: &AtomicBool,
) {
    match cmd {
        RuntimeCommand::MakeContext {
            name,
            source,
            reply,
        } => {
            let _ = reply.send(make_context(js_runtime, engine, &name, &source).await);
        }

        RuntimeCommand::Precompile {
            name,
            source,
            reply,
        } => {
            let _ = reply.send(precompile(js_runtime, engine, &name, &source));
        }

        RuntimeCommand::Call {
            context,
            function,
            args,
            reply,
        } => {
            let result = call(js_runtime, engine, context, &function, args).await;
            let _ = reply.send(result.map_err(RuntimeError::JavaScript));
        }

        RuntimeCommand::CloseContext { context, reply } => {
            if engine.contexts.remove(&context).is_some() {
                tracing::trace!(context, "closed execution context");
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }

        RuntimeCommand::HeapStatistics { reply } => {
            let _ = reply.send(Ok(heap_statistics(js_runtime, exhausted)));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JS Execution Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Build a fresh context from the template, bind the compiled script to it
/// and run its top level. The context is dropped again if any step fails.
async fn make_context(
    js_runtime: &mut JsRuntime,
    engine: &mut Engine,
    name: &str,
    source: &str,
) -> Result<ContextId, RuntimeError> {
    let run_error = |message: String| RuntimeError::Run {
        script: name.to_string(),
        message,
    };

    let id = engine.next_context;
    engine.next_context += 1;

    {
        let scope = &mut js_runtime.handle_scope();
        let unbound = engine
            .compile(scope, name, source)
            .map_err(|message| RuntimeError::Compile {
                script: name.to_string(),
                message,
            })?;
        let context = template::new_context(scope, &engine.hooks).map_err(RuntimeError::JavaScript)?;

        let scope = &mut v8::ContextScope::new(scope, context);
        let tc = &mut v8::TryCatch::new(scope);
        let script = unbound.bind_to_current_context(tc);
        if script.run(tc).is_none() {
            return Err(run_error(template::exception_message(tc)));
        }

        engine.contexts.insert(
            id,
            LiveContext {
                script: name.to_string(),
                context: v8::Global::new(tc, context),
            },
        );
    }

    // Pending work scheduled by the top level has to finish cleanly too
    if let Err(e) = js_runtime.run_event_loop(PollEventLoopOptions::default()).await {
        engine.contexts.remove(&id);
        return Err(run_error(e.to_string()));
    }

    tracing::debug!(script = %name, context = id, "execution context ready");
    Ok(id)
}

/// Compile a script into the cache without running it.
fn precompile(
    js_runtime: &mut JsRuntime,
    engine: &mut Engine,
    name: &str,
    source: &str,
) -> Result<(), RuntimeError> {
    let scope = &mut js_runtime.handle_scope();
    engine
        .compile(scope, name, source)
        .map(|_| ())
        .map_err(|message| RuntimeError::Compile {
            script: name.to_string(),
            message,
        })
}

/// Result of the template's `settle` hook.
#[derive(Debug, Deserialize)]
struct CallOutcome {
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
}

async fn call(
    js_runtime: &mut JsRuntime,
    engine: &Engine,
    context: ContextId,
    function: &str,
    args: Vec<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let live = engine
        .contexts
        .get(&context)
        .ok_or_else(|| format!("execution context {} is closed", context))?;
    if !is_identifier(function) {
        return Err(format!("invalid function name: {}", function));
    }

    let pending = {
        let scope = &mut js_runtime.handle_scope();
        let target_context = v8::Local::new(scope, &live.context);

        // Resolve the name the way the script itself would, so lexical
        // top-level declarations are found as well as global properties
        let (target, args) = {
            let scope = &mut v8::ContextScope::new(scope, target_context);
            let target = template::run_source(scope, function)?;
            if !target.is_function() {
                return Err(format!("{} is not a function in {}", function, live.script));
            }
            let args = serde_v8::to_v8(scope, &args)
                .map_err(|e| format!("Failed to serialize arguments: {}", e))?;
            (target, args)
        };

        let settle = v8::Local::new(scope, &engine.hooks.settle);
        let recv = v8::undefined(scope).into();
        let tc = &mut v8::TryCatch::new(scope);
        let Some(promise) = settle.call(tc, recv, &[target, args]) else {
            return Err(template::exception_message(tc));
        };
        v8::Global::new(tc, promise)
    };

    js_runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await
        .map_err(|e| e.to_string())?;

    let scope = &mut js_runtime.handle_scope();
    let local = v8::Local::new(scope, pending);
    let promise = v8::Local::<v8::Promise>::try_from(local)
        .map_err(|_| "call did not produce a promise".to_string())?;

    match promise.state() {
        v8::PromiseState::Fulfilled => {
            let value = promise.result(scope);
            let outcome: CallOutcome = serde_v8::from_v8(scope, value)
                .map_err(|e| format!("Failed to deserialize result: {}", e))?;
            if outcome.ok {
                Ok(outcome.value)
            } else {
                Err(outcome.message.unwrap_or_default())
            }
        }
        v8::PromiseState::Rejected => {
            let value = promise.result(scope);
            Err(value.to_rust_string_lossy(scope))
        }
        v8::PromiseState::Pending => Err("Promise still pending after event loop".to_string()),
    }
}

fn heap_statistics(js_runtime: &mut JsRuntime, exhausted: &AtomicBool) -> HeapStatistics {
    let mut stats = v8::HeapStatistics::default();
    js_runtime.v8_isolate().get_heap_statistics(&mut stats);

    HeapStatistics {
        total_heap_size: stats.total_heap_size(),
        total_available_size: stats.total_available_size(),
        used_heap_size: stats.used_heap_size(),
        heap_size_limit: stats.heap_size_limit(),
        external_memory: stats.external_memory(),
        exhausted: exhausted.load(Ordering::SeqCst),
    }
}

/// ASCII identifier check for callable names.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("main"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("$el2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("1 + 1"));
        assert!(!is_identifier("f()"));
    }
}
