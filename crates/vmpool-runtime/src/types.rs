//! Typed structures exchanged between the host and JavaScript.
//!
//! These cross the op boundary via serde_v8, so the field names match what the
//! binding template sends from JavaScript.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifies an execution context within one runtime.
pub type ContextId = u64;

/// Heap statistics sampled from a runtime's isolate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStatistics {
    pub total_heap_size: usize,
    pub total_available_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub external_memory: usize,
    /// The isolate hit its near-heap-limit callback at some point.
    pub exhausted: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem calls
// ─────────────────────────────────────────────────────────────────────────────

/// A filesystem operation requested by the `FS` binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FsCall {
    ReadFile { path: String },
    WriteFile {
        path: String,
        data: String,
        #[serde(default = "default_file_perm")]
        perm: u32,
    },
    ReadDir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Mkdir {
        path: String,
        #[serde(default = "default_dir_perm")]
        perm: u32,
    },
    MkdirAll {
        path: String,
        #[serde(default = "default_dir_perm")]
        perm: u32,
    },
    MkdirTemp {
        #[serde(default)]
        dir: String,
        #[serde(default)]
        pattern: String,
    },
    Chmod { path: String, mode: u32 },
    Remove { path: String },
    RemoveAll { path: String },
    Move { path: String, dst: String },
    Copy { path: String, dst: String },
    Exists { path: String },
    Size { path: String },
    Mode { path: String },
    ModTime { path: String },
    IsDir { path: String },
    IsFile { path: String },
    IsLink { path: String },
    MimeType { path: String },
    BaseName { path: String },
    DirName { path: String },
    ExtName { path: String },
}

fn default_file_perm() -> u32 {
    0o644
}

fn default_dir_perm() -> u32 {
    0o755
}

// ─────────────────────────────────────────────────────────────────────────────
// Store calls
// ─────────────────────────────────────────────────────────────────────────────

/// A key-value operation requested by the `Store` binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StoreCall {
    Get { key: String },
    Set {
        key: String,
        value: serde_json::Value,
        /// Time to live in seconds.
        #[serde(default)]
        ttl: Option<u64>,
    },
    Has { key: String },
    Del { key: String },
    Keys,
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// An outgoing request from the `http` binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Directory that relative file attachments resolve against. Filled in by
    /// the host, never by the script.
    #[serde(skip_deserializing, default)]
    pub files_root: std::path::PathBuf,
}

/// Response handed back to the script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}
