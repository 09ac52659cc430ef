//! Deno ops backing the binding template.
//!
//! Ops are the bridge between JavaScript and Rust. They're called from the
//! template's JavaScript via `Deno.core.ops` and reach host collaborators
//! through the [`RuntimeServices`] stored in `OpState`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use base64::Engine;
use deno_core::error::{generic_error, AnyError};
use deno_core::op2;
use deno_core::OpState;
use serde_json::{json, Value};
use vmpool_fs::{base_name, dir_name, ext_name, FileSystem, FsError};

use crate::error::CapabilityError;
use crate::services::{RuntimeName, RuntimeServices};
use crate::types::{FsCall, HttpRequest, HttpResponse, StoreCall};

fn unavailable(capability: &'static str) -> AnyError {
    generic_error(CapabilityError::NotAvailable(capability).to_string())
}

fn capability_error(err: CapabilityError) -> AnyError {
    generic_error(err.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging & Time
// ─────────────────────────────────────────────────────────────────────────────

/// Log a message at the specified level
#[op2(fast)]
pub fn op_vm_log(state: &OpState, #[string] level: &str, #[string] message: &str) {
    let runtime = &state.borrow::<RuntimeName>().0;

    match level {
        "trace" => tracing::trace!(runtime = %runtime, "{}", message),
        "debug" => tracing::debug!(runtime = %runtime, "{}", message),
        "info" => tracing::info!(runtime = %runtime, "{}", message),
        "warn" => tracing::warn!(runtime = %runtime, "{}", message),
        "error" => tracing::error!(runtime = %runtime, "{}", message),
        _ => tracing::info!(runtime = %runtime, "{}", message),
    }
}

/// Get the current timestamp in milliseconds
#[op2(fast)]
pub fn op_vm_now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

#[op2(async)]
pub async fn op_vm_sleep(ms: f64) {
    tokio::time::sleep(Duration::from_millis(ms.max(0.0) as u64)).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem
// ─────────────────────────────────────────────────────────────────────────────

#[op2]
#[serde]
pub fn op_vm_fs(
    state: &OpState,
    #[string] backend: String,
    #[serde] call: FsCall,
) -> Result<Value, AnyError> {
    if let Some(value) = path_helper(&call) {
        return Ok(value);
    }

    let services = state.borrow::<RuntimeServices>();
    let fs = services
        .filesystems
        .get(&backend)
        .map_err(|e| generic_error(e.to_string()))?;

    dispatch_fs(fs.as_ref(), call).map_err(|e| generic_error(e.to_string()))
}

/// Path helpers need no backend.
fn path_helper(call: &FsCall) -> Option<Value> {
    match call {
        FsCall::BaseName { path } => Some(json!(base_name(path))),
        FsCall::DirName { path } => Some(json!(dir_name(path))),
        FsCall::ExtName { path } => Some(json!(ext_name(path))),
        _ => None,
    }
}

pub(crate) fn dispatch_fs(fs: &dyn FileSystem, call: FsCall) -> Result<Value, FsError> {
    let value = match call {
        FsCall::ReadFile { path } => {
            let data = fs.read_file(&path)?;
            Value::String(String::from_utf8_lossy(&data).into_owned())
        }
        FsCall::WriteFile { path, data, perm } => json!(fs.write_file(&path, data.as_bytes(), perm)?),
        FsCall::ReadDir { path, recursive } => json!(fs.read_dir(&path, recursive)?),
        FsCall::Mkdir { path, perm } => {
            fs.mkdir(&path, perm)?;
            Value::Null
        }
        FsCall::MkdirAll { path, perm } => {
            fs.mkdir_all(&path, perm)?;
            Value::Null
        }
        FsCall::MkdirTemp { dir, pattern } => json!(fs.mkdir_temp(&dir, &pattern)?),
        FsCall::Chmod { path, mode } => {
            fs.chmod(&path, mode)?;
            Value::Null
        }
        FsCall::Remove { path } => {
            fs.remove(&path)?;
            Value::Null
        }
        FsCall::RemoveAll { path } => {
            fs.remove_all(&path)?;
            Value::Null
        }
        FsCall::Move { path, dst } => {
            fs.move_to(&path, &dst)?;
            Value::Null
        }
        FsCall::Copy { path, dst } => {
            fs.copy(&path, &dst)?;
            Value::Null
        }
        FsCall::Exists { path } => json!(fs.exists(&path)?),
        FsCall::Size { path } => json!(fs.size(&path)?),
        FsCall::Mode { path } => json!(fs.mode(&path)?),
        FsCall::ModTime { path } => json!(fs.mod_time(&path)?.timestamp_millis()),
        FsCall::IsDir { path } => json!(fs.is_dir(&path)),
        FsCall::IsFile { path } => json!(fs.is_file(&path)),
        FsCall::IsLink { path } => json!(fs.is_link(&path)),
        FsCall::MimeType { path } => json!(fs.mime_type(&path)?),
        FsCall::BaseName { path } => json!(base_name(&path)),
        FsCall::DirName { path } => json!(dir_name(&path)),
        FsCall::ExtName { path } => json!(ext_name(&path)),
    };
    Ok(value)
}

// ─────────────────────────────────────────────────────────────────────────────
// Network & Data
// ─────────────────────────────────────────────────────────────────────────────

#[op2(async)]
#[serde]
pub async fn op_vm_http(
    state: Rc<RefCell<OpState>>,
    #[serde] request: HttpRequest,
) -> Result<HttpResponse, AnyError> {
    let (client, data_root) = {
        let state = state.borrow();
        let services = state.borrow::<RuntimeServices>();
        (services.http.clone(), services.data_root.clone())
    };
    let client = client.ok_or_else(|| unavailable("http"))?;

    let mut request = request;
    request.files_root = data_root;
    client.send(request).await.map_err(capability_error)
}

#[op2(async)]
#[serde]
pub async fn op_vm_store(
    state: Rc<RefCell<OpState>>,
    #[string] store: String,
    #[serde] call: StoreCall,
) -> Result<Value, AnyError> {
    let kv = {
        let state = state.borrow();
        state.borrow::<RuntimeServices>().store.clone()
    };
    let kv = kv.ok_or_else(|| unavailable("Store"))?;

    let value = match call {
        StoreCall::Get { key } => json!(kv.get(&store, &key).await.map_err(capability_error)?),
        StoreCall::Set { key, value, ttl } => {
            kv.set(&store, &key, value, ttl.map(Duration::from_secs))
                .await
                .map_err(capability_error)?;
            Value::Null
        }
        StoreCall::Has { key } => json!(kv.has(&store, &key).await.map_err(capability_error)?),
        StoreCall::Del { key } => {
            kv.del(&store, &key).await.map_err(capability_error)?;
            Value::Null
        }
        StoreCall::Keys => json!(kv.keys(&store).await.map_err(capability_error)?),
    };
    Ok(value)
}

#[op2(async)]
#[serde]
pub async fn op_vm_query(
    state: Rc<RefCell<OpState>>,
    #[string] engine: String,
    #[serde] dsl: Value,
) -> Result<Value, AnyError> {
    let query = {
        let state = state.borrow();
        state.borrow::<RuntimeServices>().query.clone()
    };
    let query = query.ok_or_else(|| unavailable("Query"))?;
    query.run(&engine, dsl).await.map_err(capability_error)
}

// ─────────────────────────────────────────────────────────────────────────────
// Jobs & Messaging
// ─────────────────────────────────────────────────────────────────────────────

#[op2]
#[string]
pub fn op_vm_job_dispatch(
    state: &OpState,
    #[string] name: String,
    #[serde] payload: Value,
) -> Result<String, AnyError> {
    let jobs = state
        .borrow::<RuntimeServices>()
        .jobs
        .clone()
        .ok_or_else(|| unavailable("Job"))?;
    jobs.dispatch(&name, payload).map_err(capability_error)
}

#[op2]
pub fn op_vm_publish(
    state: &OpState,
    #[string] channel: String,
    #[serde] message: Value,
) -> Result<(), AnyError> {
    let bus = state
        .borrow::<RuntimeServices>()
        .messaging
        .clone()
        .ok_or_else(|| unavailable("WebSocket"))?;
    bus.publish(&channel, message).map_err(capability_error)
}

// ─────────────────────────────────────────────────────────────────────────────
// Localization, Processes & Modules
// ─────────────────────────────────────────────────────────────────────────────

/// Translate a key; without a translator the key is returned as is.
#[op2]
#[string]
pub fn op_vm_translate(
    state: &OpState,
    #[string] key: String,
    #[serde] locale: Option<String>,
) -> String {
    match &state.borrow::<RuntimeServices>().translator {
        Some(translator) => translator.translate(&key, locale.as_deref()),
        None => key,
    }
}

#[op2(async)]
#[serde]
pub async fn op_vm_process(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[serde] args: Vec<Value>,
) -> Result<Value, AnyError> {
    let processes = {
        let state = state.borrow();
        state.borrow::<RuntimeServices>().processes.clone()
    };
    let processes = processes.ok_or_else(|| unavailable("Process"))?;
    processes.call(&name, args).await.map_err(capability_error)
}

#[op2(async)]
#[serde]
pub async fn op_vm_studio(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[serde] args: Vec<Value>,
) -> Result<Value, AnyError> {
    let host = {
        let state = state.borrow();
        state.borrow::<RuntimeServices>().host.clone()
    };
    let host = host.ok_or_else(|| unavailable("Studio"))?;
    host.call(&name, args).await.map_err(capability_error)
}

#[op2]
#[string]
pub fn op_vm_require(state: &OpState, #[string] name: String) -> Result<String, AnyError> {
    let modules = state
        .borrow::<RuntimeServices>()
        .modules
        .clone()
        .ok_or_else(|| unavailable("Require"))?;
    modules.load(&name).map_err(capability_error)
}

// ─────────────────────────────────────────────────────────────────────────────
// Codecs
// ─────────────────────────────────────────────────────────────────────────────

#[op2]
#[string]
pub fn op_vm_btoa(#[string] data: String) -> Result<String, AnyError> {
    encode_binary_string(&data).map_err(generic_error)
}

#[op2]
#[string]
pub fn op_vm_atob(#[string] data: String) -> Result<String, AnyError> {
    decode_binary_string(&data).map_err(generic_error)
}

/// Base64-encode a binary string (one byte per UTF-16 code unit).
pub(crate) fn encode_binary_string(data: &str) -> Result<String, String> {
    let bytes = data
        .chars()
        .map(|c| u8::try_from(u32::from(c)))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| "btoa: string contains characters outside of the Latin1 range".to_string())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Decode base64 into a binary string. Whitespace and padding are optional.
pub(crate) fn decode_binary_string(data: &str) -> Result<String, String> {
    let cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let unpadded = cleaned.trim_end_matches('=');
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(unpadded)
        .map_err(|e| format!("atob: invalid base64 input: {}", e))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension Definition
// ─────────────────────────────────────────────────────────────────────────────

deno_core::extension!(
    vm_bindings,
    ops = [
        op_vm_log,
        op_vm_now_ms,
        op_vm_sleep,
        op_vm_fs,
        op_vm_http,
        op_vm_store,
        op_vm_query,
        op_vm_job_dispatch,
        op_vm_publish,
        op_vm_translate,
        op_vm_process,
        op_vm_studio,
        op_vm_require,
        op_vm_btoa,
        op_vm_atob,
    ],
);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vmpool_fs::LocalFileSystem;

    #[test]
    fn test_binary_string_codec() {
        assert_eq!(encode_binary_string("hello").unwrap(), "aGVsbG8=");
        assert_eq!(decode_binary_string("aGVsbG8=").unwrap(), "hello");
        assert_eq!(decode_binary_string("aGVs bG8").unwrap(), "hello");
        assert_eq!(encode_binary_string("\u{ff}").unwrap(), "/w==");
        assert!(encode_binary_string("€").is_err());
        assert!(decode_binary_string("%%%").is_err());
    }

    #[test]
    fn test_dispatch_fs() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path());

        let written = dispatch_fs(
            &fs,
            FsCall::WriteFile {
                path: "/a/b.txt".into(),
                data: "content".into(),
                perm: 0o644,
            },
        )
        .unwrap();
        assert_eq!(written, json!(7));

        let read = dispatch_fs(&fs, FsCall::ReadFile { path: "/a/b.txt".into() }).unwrap();
        assert_eq!(read, json!("content"));

        let listing = dispatch_fs(
            &fs,
            FsCall::ReadDir {
                path: "/".into(),
                recursive: true,
            },
        )
        .unwrap();
        assert_eq!(listing, json!(["/a", "/a/b.txt"]));

        let ext = dispatch_fs(&fs, FsCall::ExtName { path: "/a/b.txt".into() }).unwrap();
        assert_eq!(ext, json!("txt"));
    }

    #[test]
    fn test_path_helpers_skip_backend_lookup() {
        let call = FsCall::DirName {
            path: "/scripts/app.js".into(),
        };
        assert_eq!(path_helper(&call), Some(json!("/scripts")));
        assert_eq!(path_helper(&FsCall::Exists { path: "/".into() }), None);
    }
}
