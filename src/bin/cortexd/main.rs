//! The binary entrypoint for `cortexd`, the per-project code-index cache
//! daemon. Adapted from the teacher's `bin/hurry/main.rs` shape: a
//! `clap`-derived CLI, `color_eyre::install()`, then dispatch
//! (SPEC_FULL.md §10.3).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::signal;
use tracing::{info, instrument, warn};
use tracing_subscriber::util::SubscriberInitExt;

use cortex_core::fs;
use cortex_core::indexer::{NullEmbedder, NullIndexer};
use cortex_core::path::{AbsDirPath, TryJoinWith};
use cortex_core::registry::Registry;
use cortex_core::server::Server;
use cortex_core::server::rpc;

mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "cortexd", about = "Per-project code-index cache daemon", version = crate_version!())]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Emit flamegraph profiling data.
    #[arg(short, long, hide(true))]
    profile: Option<PathBuf>,

    /// When to colorize output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Manage the cortexd daemon process.
    #[clap(subcommand)]
    Daemon(DaemonCommand),

    /// Register a project path with the running daemon.
    Register {
        path: PathBuf,
    },

    /// Unregister a project path from the running daemon.
    Unregister {
        path: PathBuf,

        /// Also delete the project's entire cache directory.
        #[arg(long)]
        remove_cache: bool,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum DaemonCommand {
    /// Start the daemon.
    Start {
        /// Run in the foreground instead of detaching.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a running daemon.
    Stop,
}

/// `<home>/.cortex`, unless overridden by `CORTEX_CONFIG_DIR`.
async fn cortex_dir() -> Result<AbsDirPath> {
    match std::env::var("CORTEX_CONFIG_DIR") {
        Ok(value) => AbsDirPath::try_from(value).context("parse CORTEX_CONFIG_DIR"),
        Err(_) => fs::user_config_root().await,
    }
}

/// `<home>/.cortex/cache`, unless overridden by `CORTEX_CACHE_ROOT`.
async fn cache_root() -> Result<AbsDirPath> {
    match std::env::var("CORTEX_CACHE_ROOT") {
        Ok(value) => AbsDirPath::try_from(value).context("parse CORTEX_CACHE_ROOT"),
        Err(_) => fs::user_cache_root().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let (logger, flame_guard) = log::make_logger(std::io::stderr, top.profile.clone(), top.color)?;

    let result = match top.command.clone() {
        Command::Daemon(DaemonCommand::Start { foreground }) => {
            logger.init();
            daemon_start(foreground).await
        }
        Command::Daemon(DaemonCommand::Stop) => {
            logger.init();
            daemon_stop().await
        }
        Command::Register { path } => {
            logger.init();
            register(path).await
        }
        Command::Unregister { path, remove_cache } => {
            logger.init();
            unregister(path, remove_cache).await
        }
    };

    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame_guard")?;
    }

    result
}

/// The daemon's discoverable context: where it's listening and since when
/// (SPEC_FULL.md §10.4 step 4).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct DaemonContext {
    pid: u32,
    started_at: i64,
    socket_path: String,
}

fn daemon_context_path(cortex_dir: &AbsDirPath) -> Result<cortex_core::path::AbsFilePath> {
    cortex_dir.try_join_file("daemon.json").context("build daemon context path")
}

fn daemon_pid_file_path(cortex_dir: &AbsDirPath) -> Result<cortex_core::path::AbsFilePath> {
    cortex_dir.try_join_file("daemon.pid").context("build daemon pid file path")
}

/// The daemon bootstrap sequence (SPEC_FULL.md §10.4), grounded in the
/// teacher's `bin/hurry/cmd/daemon/start.rs`.
#[instrument(skip_all)]
async fn daemon_start(_foreground: bool) -> Result<()> {
    let cortex_dir = cortex_dir().await.context("resolve cortex dir")?;
    let cache_root = cache_root().await.context("resolve cache root")?;
    fs::create_dir_all(&cortex_dir).await.context("create cortex dir")?;
    fs::create_dir_all(&cache_root).await.context("create cache root")?;

    let pid_file_path = daemon_pid_file_path(&cortex_dir)?;
    let mut pid_file = fslock::LockFile::open(pid_file_path.as_os_str()).context("open pid file")?;
    if !pid_file.try_lock_with_pid().context("lock pid file")? {
        bail!("cortexd is already running");
    }

    #[cfg(unix)]
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGHUP, || {
            tracing::warn!("ignoring SIGHUP");
        })
        .context("register SIGHUP handler")?;
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind local listener")?;
    let addr = listener.local_addr().context("read listener address")?;
    info!(?addr, "cortexd listening");

    let registry = Registry::load(cortex_dir.clone()).await.context("load registry")?;
    let server = Arc::new(Server::new(
        addr.to_string(),
        cache_root,
        registry,
        Arc::new(NullIndexer::default()),
        Arc::new(NullEmbedder),
    ));
    let app = rpc::router(server.clone());

    let context = DaemonContext {
        pid: std::process::id(),
        started_at: server.daemon_status().started_at,
        socket_path: addr.to_string(),
    };
    let context_path = daemon_context_path(&cortex_dir)?;
    let encoded = serde_json::to_string(&context).context("encode daemon context")?;
    fs::write(&context_path, encoded).await.context("write daemon context")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(server.clone()))
        .await
        .context("serve rpc");

    info!("exiting; cleaning up daemon files");
    if let Err(err) = fs::remove_file(&pid_file_path).await {
        warn!(?err, "failed to remove pid file");
    }
    if let Err(err) = fs::remove_file(&context_path).await {
        warn!(?err, "failed to remove daemon context file");
    }

    served
}

/// Wait for SIGINT/SIGTERM or an explicit `Shutdown` RPC
/// (SPEC_FULL.md §10.4 step 7). Unlike the teacher's `hurry` daemon, there
/// is no idle-timeout arm: `cortexd` runs indefinitely once started.
async fn shutdown_signal(server: Arc<Server>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let mut rpc_shutdown = server.shutdown_signal();
    let explicit_shutdown = async {
        let _ = rpc_shutdown.changed().await;
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
        _ = explicit_shutdown => info!("received explicit shutdown request"),
    }

    server.shutdown_internal().await;
}

async fn daemon_stop() -> Result<()> {
    let cortex_dir = cortex_dir().await.context("resolve cortex dir")?;
    let Some(context) = read_daemon_context(&cortex_dir).await? else {
        bail!("cortexd is not running");
    };

    http_post(&context.socket_path, "/api/v1/shutdown", None)
        .await
        .context("send shutdown request")?;
    Ok(())
}

async fn register(path: PathBuf) -> Result<()> {
    let cortex_dir = cortex_dir().await.context("resolve cortex dir")?;
    if read_daemon_context(&cortex_dir).await?.is_none() {
        bail!("cortexd is not running; start it with `cortexd daemon start`");
    }
    let project_path = canonical_abs_dir(path)?;

    // `register` has no standalone RPC of its own (spec.md §6 folds
    // registration into `Index`); this wrapper registers directly against
    // the daemon's own config root, matching the Projects Registry
    // contract a live daemon would apply on its next `Index` call.
    let registry = Registry::load(cortex_dir).await.context("load registry")?;
    let vcs = cortex_core::vcs::GitVcs;
    let entry = registry.register(&vcs, &project_path).await.context("register project")?;
    println!("registered {} (cache_key={})", entry.path, entry.cache_key);
    Ok(())
}

async fn unregister(path: PathBuf, remove_cache: bool) -> Result<()> {
    let cortex_dir = cortex_dir().await.context("resolve cortex dir")?;
    let Some(context) = read_daemon_context(&cortex_dir).await? else {
        bail!("cortexd is not running; start it with `cortexd daemon start`");
    };
    let project_path = canonical_abs_dir(path)?;

    let body = serde_json::json!({
        "project_path": project_path.as_str_lossy(),
        "remove_cache": remove_cache,
    });
    let response = http_post(&context.socket_path, "/api/v1/projects/unregister", Some(body))
        .await
        .context("send unregister request")?;
    println!("{response}");
    Ok(())
}

fn canonical_abs_dir(path: PathBuf) -> Result<AbsDirPath> {
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir().context("read cwd")?.join(path)
    };
    AbsDirPath::try_from(absolute).context("project path must be an absolute, existing directory")
}

async fn read_daemon_context(cortex_dir: &AbsDirPath) -> Result<Option<DaemonContext>> {
    let path = daemon_context_path(cortex_dir)?;
    match fs::read_buffered_utf8(&path).await? {
        Some(content) => Ok(Some(serde_json::from_str(&content).context("parse daemon context")?)),
        None => Ok(None),
    }
}

/// Minimal synchronous-shaped HTTP/1.1 POST over a raw TCP socket to the
/// loopback daemon. These CLI wrappers are explicitly out-of-scope beyond
/// this minimal shape (spec.md §1 / SPEC_FULL.md §10.3); a richer HTTP
/// client crate would be overkill for what's effectively a local IPC call.
async fn http_post(addr: &str, path: &str, body: Option<serde_json::Value>) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await.context("connect to daemon")?;
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    request.push_str(&payload);

    stream.write_all(request.as_bytes()).await.context("write request")?;
    stream.flush().await.context("flush request")?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.context("read response")?;
    let response = String::from_utf8_lossy(&response).into_owned();

    let body_start = response.find("\r\n\r\n").map(|idx| idx + 4).unwrap_or(response.len());
    Ok(response[body_start..].to_string())
}
