//! Binding template and the execution contexts built from it.

use deno_core::v8;
use deno_core::JsRuntime;

use crate::error::RuntimeError;

/// Global names the template defines. Scripts can rely on every one of them.
pub const BINDING_NAMES: [&str; 15] = [
    "log",
    "time",
    "http",
    "Exception",
    "FS",
    "Job",
    "Store",
    "Query",
    "WebSocket",
    "$L",
    "Process",
    "Studio",
    "Require",
    "atob",
    "btoa",
];

const TEMPLATE_JS: &str = include_str!("template.js");

/// Compiles `Require`d module source as a function of the context it runs in.
/// `Function` is captured before any user code can replace it.
const MODULE_LOADER_JS: &str =
    "((F) => (source) => new F('module', 'exports', 'Require', source))(Function)";

/// Functions the template leaves behind in the host context.
pub(crate) struct Hooks {
    /// `(load) => bindings`, one fresh set per execution context.
    bindings: v8::Global<v8::Function>,
    /// `(target, args) => Promise<{ ok, value, message }>`.
    pub(crate) settle: v8::Global<v8::Function>,
}

/// Run the template in the host context and keep its hooks.
pub(crate) fn install(js_runtime: &mut JsRuntime) -> Result<Hooks, RuntimeError> {
    let result = js_runtime
        .execute_script("<vm:template>", TEMPLATE_JS)
        .map_err(|e| RuntimeError::JavaScript(e.to_string()))?;

    let scope = &mut js_runtime.handle_scope();
    let local = v8::Local::new(scope, result);
    let hooks = v8::Local::<v8::Object>::try_from(local).map_err(|_| {
        RuntimeError::JavaScript("binding template did not return its hooks".to_string())
    })?;

    Ok(Hooks {
        bindings: hook(scope, hooks, "bindings")?,
        settle: hook(scope, hooks, "settle")?,
    })
}

fn hook(
    scope: &mut v8::HandleScope,
    hooks: v8::Local<v8::Object>,
    name: &str,
) -> Result<v8::Global<v8::Function>, RuntimeError> {
    let missing = || RuntimeError::JavaScript(format!("binding template is missing {}", name));
    let key = v8::String::new(scope, name).ok_or_else(missing)?;
    let value = hooks.get(scope, key.into()).ok_or_else(missing)?;
    let function = v8::Local::<v8::Function>::try_from(value).map_err(|_| missing())?;
    Ok(v8::Global::new(scope, function))
}

/// Create a fresh V8 context with its own global object and a fresh set of
/// bindings defined on it as read-only, non-deletable properties.
///
/// `scope` must have the host context entered.
pub(crate) fn new_context<'s>(
    scope: &mut v8::HandleScope<'s>,
    hooks: &Hooks,
) -> Result<v8::Local<'s, v8::Context>, String> {
    let host = scope.get_current_context();
    let context = v8::Context::new(scope, Default::default());

    // deno_core finds its realm state through these slots whenever this
    // context is current (promise rejection tracking, op dispatch).
    // SAFETY: the host realm outlives every context the worker creates; the
    // worker drops its contexts before the runtime.
    unsafe {
        for slot in [
            deno_core::CONTEXT_STATE_SLOT_INDEX,
            deno_core::MODULE_MAP_SLOT_INDEX,
        ] {
            let data = host.get_aligned_pointer_from_embedder_data(slot);
            context.set_aligned_pointer_in_embedder_data(slot, data);
        }
    }

    let loader = {
        let scope = &mut v8::ContextScope::new(scope, context);
        run_source(scope, MODULE_LOADER_JS)?
    };

    let factory = v8::Local::new(scope, &hooks.bindings);
    let recv = v8::undefined(scope).into();
    let bindings = {
        let tc = &mut v8::TryCatch::new(scope);
        let value = factory
            .call(tc, recv, &[loader])
            .ok_or_else(|| exception_message(tc))?;
        v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| "binding template returned no bindings".to_string())?
    };

    let scope = &mut v8::ContextScope::new(scope, context);
    let global = context.global(scope);
    let mut missing = Vec::new();

    for name in BINDING_NAMES {
        let key = v8::String::new(scope, name)
            .ok_or_else(|| format!("could not allocate binding name {}", name))?;
        match bindings.get(scope, key.into()) {
            Some(value) if !value.is_undefined() => {
                let attributes =
                    v8::PropertyAttribute::READ_ONLY | v8::PropertyAttribute::DONT_DELETE;
                global.define_own_property(scope, key.into(), value, attributes);
            }
            _ => missing.push(name),
        }
    }

    if !missing.is_empty() {
        return Err(format!(
            "binding template left globals undefined: {}",
            missing.join(", ")
        ));
    }
    Ok(context)
}

/// Compile and run `source` in the current context.
pub(crate) fn run_source<'s>(
    scope: &mut v8::HandleScope<'s>,
    source: &str,
) -> Result<v8::Local<'s, v8::Value>, String> {
    let code = v8::String::new(scope, source).ok_or_else(|| "source is too large".to_string())?;
    let tc = &mut v8::TryCatch::new(scope);
    let Some(script) = v8::Script::compile(tc, code, None) else {
        return Err(exception_message(tc));
    };
    match script.run(tc) {
        Some(value) => Ok(value),
        None => Err(exception_message(tc)),
    }
}

/// Describe the exception caught by `tc`.
pub(crate) fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if tc.has_terminated() {
        return "execution terminated".to_string();
    }
    match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "unknown error".to_string(),
    }
}
