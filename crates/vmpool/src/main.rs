//! vmpool command line
//!
//! Runs a script through a VM pool, mostly for trying scripts out and for
//! checking a pool configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmpool::fs::{FsRegistry, LocalFileSystem};
use vmpool::runtime::RuntimeServices;
use vmpool::{PoolConfig, Script, ScriptRegistry, VmPool};

/// VM pool runner
#[derive(Parser, Debug)]
#[command(name = "vmpool")]
#[command(about = "Run scripts on a pool of V8 instances", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a script, run it and optionally call one of its functions
    Run {
        /// Script file
        file: PathBuf,

        /// Function to call after the top level ran
        #[arg(long)]
        call: Option<String>,

        /// JSON array of arguments for --call
        #[arg(long, default_value = "[]")]
        args: String,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run the script this many times, each on a freshly acquired instance
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },
}

fn main() -> Result<()> {
    // V8 has to be initialized on the main thread before any runtime exists
    vmpool::runtime::init_platform();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmpool=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            file,
            call,
            args,
            config,
            repeat,
        } => run(file, call, &args, config, repeat).await,
    }
}

async fn run(
    file: PathBuf,
    call: Option<String>,
    args: &str,
    config: Option<PathBuf>,
    repeat: usize,
) -> Result<()> {
    let config = PoolConfig::load(config.as_deref())?;
    let args: Vec<serde_json::Value> =
        serde_json::from_str(args).context("--args must be a JSON array")?;

    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("script path has no file name")?;
    let script = Script::from_fs(&LocalFileSystem::new(dir), &format!("/{}", name))
        .with_context(|| format!("failed to read {}", file.display()))?;

    let scripts = Arc::new(ScriptRegistry::new());
    let script = scripts.register(script);

    let services = RuntimeServices {
        filesystems: Arc::new(FsRegistry::with_system(&config.data_root)),
        data_root: config.data_root.clone(),
        ..Default::default()
    };

    let select_timeout = config.select_timeout();
    let pool = VmPool::new(config, services, scripts);
    pool.start().await?;

    for round in 0..repeat.max(1) {
        let instance = pool.select_instance(select_timeout).await?;
        info!(instance = %instance.id(), round, script = %script.name, "running script");

        let result = async {
            let context = instance.make_context(&script).await?;
            let value = match &call {
                Some(function) => context.call(function, args.clone()).await?,
                None => serde_json::Value::Null,
            };
            context.close().await?;
            Ok::<_, vmpool::PoolError>(value)
        }
        .await;

        pool.release(instance).await;
        println!("{}", serde_json::to_string_pretty(&result?)?);
    }

    info!(stats = ?pool.stats(), "done");
    pool.shutdown().await;
    Ok(())
}
