use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use vmpool_fs::FsRegistry;
use vmpool_runtime::{
    spawn_runtime, CapabilityError, EngineOptions, ModuleSource, RuntimeError, RuntimeHandle,
    RuntimeServices, BINDING_NAMES,
};

async fn spawn(services: RuntimeServices) -> RuntimeHandle {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    tokio::task::spawn_blocking(move || {
        spawn_runtime(
            "test-runtime".to_string(),
            EngineOptions {
                heap_size_limit: 256 * 1024 * 1024,
                services,
            },
        )
    })
    .await
    .unwrap()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bindings_are_read_only_globals() {
    let runtime = spawn(RuntimeServices::default()).await;
    let context = runtime
        .make_context(
            "bindings.js",
            r#"
            function describe(names) {
                return names.map((name) => {
                    const desc = Object.getOwnPropertyDescriptor(globalThis, name);
                    return { name, defined: desc !== undefined, writable: desc ? desc.writable : null };
                });
            }
            "#,
        )
        .await
        .unwrap();

    let result = runtime
        .call(context, "describe", vec![json!(BINDING_NAMES)])
        .await
        .unwrap();

    let entries = result.as_array().unwrap();
    assert_eq!(entries.len(), BINDING_NAMES.len());
    for entry in entries {
        assert_eq!(entry["defined"], json!(true), "{} missing", entry["name"]);
        assert_eq!(entry["writable"], json!(false), "{} writable", entry["name"]);
    }

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compile_error_leaves_runtime_usable() {
    let runtime = spawn(RuntimeServices::default()).await;

    let err = runtime.make_context("broken.js", "function (").await.unwrap_err();
    match err {
        RuntimeError::Compile { script, message } => {
            assert_eq!(script, "broken.js");
            assert!(message.contains("SyntaxError"), "unexpected message: {}", message);
        }
        other => panic!("expected compile error, got {:?}", other),
    }

    let context = runtime
        .make_context("ok.js", "function answer() { return 42; }")
        .await
        .unwrap();
    let result = runtime.call(context, "answer", vec![]).await.unwrap();
    assert_eq!(result, json!(42));

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_top_level_throw_is_a_run_error() {
    let runtime = spawn(RuntimeServices::default()).await;

    let err = runtime
        .make_context("throws.js", "throw new Exception('boom', 400);")
        .await
        .unwrap_err();
    match err {
        RuntimeError::Run { script, message } => {
            assert_eq!(script, "throws.js");
            assert!(message.contains("boom"), "unexpected message: {}", message);
        }
        other => panic!("expected run error, got {:?}", other),
    }

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_awaits_promises() {
    let runtime = spawn(RuntimeServices::default()).await;
    let context = runtime
        .make_context(
            "async.js",
            r#"
            const offset = 10;
            async function add(a, b) {
                await time.sleep(1);
                return a + b + offset;
            }
            function nothing() {}
            function stamp() { return time.now(); }
            "#,
        )
        .await
        .unwrap();

    let result = runtime
        .call(context, "add", vec![json!(1), json!(2)])
        .await
        .unwrap();
    assert_eq!(result, json!(13));

    let result = runtime.call(context, "nothing", vec![]).await.unwrap();
    assert_eq!(result, serde_json::Value::Null);

    let before = chrono::Utc::now().timestamp_millis();
    let stamp = runtime.call(context, "stamp", vec![]).await.unwrap().as_f64().unwrap() as i64;
    assert!(stamp >= before && stamp <= chrono::Utc::now().timestamp_millis());

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_errors() {
    let runtime = spawn(RuntimeServices::default()).await;
    let context = runtime
        .make_context("calls.js", "const value = 1; function fail() { throw new Error('nope'); }")
        .await
        .unwrap();

    let err = runtime.call(context, "missing", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("missing is not defined"), "{}", err);

    let err = runtime.call(context, "value", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("not a function"), "{}", err);

    let err = runtime.call(context, "1 + 1", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("invalid function name"), "{}", err);

    let err = runtime.call(context, "fail", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("Error: nope"), "{}", err);

    runtime.close_context(context).await.unwrap();
    let err = runtime.call(context, "fail", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("is closed"), "{}", err);

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_contexts_do_not_share_top_level_state() {
    let runtime = spawn(RuntimeServices::default()).await;
    let first = runtime
        .make_context("a.js", "let count = 0; function bump() { return ++count; }")
        .await
        .unwrap();
    let second = runtime
        .make_context("b.js", "let count = 100; function bump() { return ++count; }")
        .await
        .unwrap();

    assert_eq!(runtime.call(first, "bump", vec![]).await.unwrap(), json!(1));
    assert_eq!(runtime.call(first, "bump", vec![]).await.unwrap(), json!(2));
    assert_eq!(runtime.call(second, "bump", vec![]).await.unwrap(), json!(101));

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_writes_stay_in_their_context() {
    let runtime = spawn(RuntimeServices::default()).await;
    let writer = runtime
        .make_context(
            "writer.js",
            r#"
            leaked = "from-writer";
            globalThis.other = 7;
            Exception.prototype.tag = "patched";
            function peek() { return [typeof leaked, typeof other]; }
            "#,
        )
        .await
        .unwrap();
    assert_eq!(
        runtime.call(writer, "peek", vec![]).await.unwrap(),
        json!(["string", "number"])
    );
    runtime.close_context(writer).await.unwrap();

    let reader = runtime
        .make_context(
            "reader.js",
            r#"
            function peek() {
                return [
                    typeof leaked,
                    typeof other,
                    typeof new Exception("x").tag,
                    typeof __vm_internal,
                    typeof Deno,
                ];
            }
            "#,
        )
        .await
        .unwrap();
    assert_eq!(
        runtime.call(reader, "peek", vec![]).await.unwrap(),
        json!(["undefined", "undefined", "undefined", "undefined", "undefined"])
    );

    runtime.join().unwrap();
}

struct CounterModules;

impl ModuleSource for CounterModules {
    fn load(&self, name: &str) -> Result<String, CapabilityError> {
        match name {
            "counter" => Ok(r#"
                let count = 0;
                globalThis.counterLoaded = true;
                module.exports = { bump: () => ++count };
                "#
            .to_string()),
            other => Err(CapabilityError::NotRegistered(other.to_string())),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_require_cache_is_per_context() {
    let services = RuntimeServices {
        modules: Some(Arc::new(CounterModules)),
        ..Default::default()
    };
    let runtime = spawn(services).await;
    let source = r#"
        const counter = Require("counter");
        function bump() { return counter.bump(); }
        function again() { return Require("counter") === counter; }
    "#;

    let first = runtime.make_context("first.js", source).await.unwrap();
    let second = runtime.make_context("second.js", source).await.unwrap();
    let bystander = runtime
        .make_context("bystander.js", "function loaded() { return typeof counterLoaded; }")
        .await
        .unwrap();

    assert_eq!(runtime.call(first, "bump", vec![]).await.unwrap(), json!(1));
    assert_eq!(runtime.call(first, "bump", vec![]).await.unwrap(), json!(2));
    assert_eq!(runtime.call(first, "again", vec![]).await.unwrap(), json!(true));
    assert_eq!(runtime.call(second, "bump", vec![]).await.unwrap(), json!(1));
    assert_eq!(
        runtime.call(bystander, "loaded", vec![]).await.unwrap(),
        json!("undefined")
    );

    let err = runtime
        .make_context("missing.js", "Require('nowhere');")
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Run { .. }), "{:?}", err);

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_top_level_return_is_a_compile_error() {
    let runtime = spawn(RuntimeServices::default()).await;

    let err = runtime.make_context("return.js", "return 5;").await.unwrap_err();
    match err {
        RuntimeError::Compile { script, message } => {
            assert_eq!(script, "return.js");
            assert!(message.contains("SyntaxError"), "unexpected message: {}", message);
        }
        other => panic!("expected compile error, got {:?}", other),
    }

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_codecs_and_filesystem() {
    let dir = TempDir::new().unwrap();
    let services = RuntimeServices {
        filesystems: Arc::new(FsRegistry::with_system(dir.path())),
        ..Default::default()
    };
    let runtime = spawn(services).await;
    let context = runtime
        .make_context(
            "fs.js",
            r#"
            function roundTrip(text) {
                return atob(btoa(text));
            }
            function store(path, text) {
                const fs = new FS();
                fs.WriteFile(path, text);
                return { content: fs.ReadFile(path), ext: fs.ExtName(path), exists: fs.Exists(path) };
            }
            function missingBackend() {
                return new FS("nowhere").Exists("/");
            }
            "#,
        )
        .await
        .unwrap();

    let result = runtime
        .call(context, "roundTrip", vec![json!("hello")])
        .await
        .unwrap();
    assert_eq!(result, json!("hello"));

    let result = runtime
        .call(context, "store", vec![json!("/notes/a.txt"), json!("hi")])
        .await
        .unwrap();
    assert_eq!(result, json!({"content": "hi", "ext": "txt", "exists": true}));
    assert_eq!(std::fs::read_to_string(dir.path().join("notes/a.txt")).unwrap(), "hi");

    let err = runtime.call(context, "missingBackend", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("nowhere is not registered"), "{}", err);

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_capability_rejects_in_script() {
    let runtime = spawn(RuntimeServices::default()).await;
    let context = runtime
        .make_context(
            "store.js",
            r#"
            async function read() { return await new Store("cache").Get("key"); }
            function translate() { return $L("greeting"); }
            "#,
        )
        .await
        .unwrap();

    let err = runtime.call(context, "read", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("Store is not available"), "{}", err);

    let result = runtime.call(context, "translate", vec![]).await.unwrap();
    assert_eq!(result, json!("greeting"));

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_precompile_and_heap_statistics() {
    let runtime = spawn(RuntimeServices::default()).await;

    runtime
        .precompile("good.js", "function ok() { return 1; }")
        .await
        .unwrap();
    let err = runtime.precompile("bad.js", "let = ;").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Compile { ref script, .. } if script == "bad.js"));

    // The cached script is bound to a new context; a changed source is recompiled
    let context = runtime
        .make_context("good.js", "function ok() { return 1; }")
        .await
        .unwrap();
    assert_eq!(runtime.call(context, "ok", vec![]).await.unwrap(), json!(1));
    let context = runtime
        .make_context("good.js", "function ok() { return 2; }")
        .await
        .unwrap();
    assert_eq!(runtime.call(context, "ok", vec![]).await.unwrap(), json!(2));

    let stats = runtime.heap_statistics().await.unwrap();
    assert!(stats.total_heap_size > 0);
    assert!(stats.heap_size_limit > 0);
    assert!(!stats.exhausted);

    runtime.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminated_runtime_rejects_commands() {
    let runtime = spawn(RuntimeServices::default()).await;
    let terminator = runtime.terminator();

    terminator.terminate();
    assert!(runtime.is_terminated());

    let err = runtime.heap_statistics().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Terminated));

    runtime.join().unwrap();
}
