//! `pclink`: the PCLink host daemon binary. Wires every `pclink-core`
//! domain component to the `pclink-web` router and drives the TLS
//! accept loop, plus the administrative CLI surface (spec.md §6).

mod cli;
mod client;
mod instance_lock;
mod logging;
mod paths;
mod serve;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};

use pclink_core::auth::OperatorAuth;
use pclink_core::config::Config;
use pclink_core::devices::DeviceRegistry;
use pclink_core::hub::SessionHub;
use pclink_core::identity::ServerIdentity;
use pclink_core::listener::ListenerControl;
use pclink_core::pairing::PairingBroker;
use pclink_core::ratelimit::RateLimiter;
use pclink_core::transfer::{cleanup, TransferEngine};
use pclink_web::AppState;

use crate::cli::{Cli, Command};
use crate::instance_lock::InstanceLock;

/// How often the periodic stale-transfer sweep runs, independent of the
/// configurable staleness threshold itself (spec.md §4.7.5).
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How often the discovery supervisor re-checks `setup_complete`.
const DISCOVERY_SUPERVISOR_TICK: Duration = Duration::from_secs(1);

const EXIT_OK: i32 = 0;
const EXIT_GENERIC: i32 = 1;
const EXIT_ALREADY_RUNNING: i32 = 2;
const EXIT_CONFIG_INVALID: i32 = 3;

fn main() -> anyhow::Result<()> {
    // rustls 0.23 requires a process-level crypto provider when more than
    // one backend is reachable in the dependency graph; install explicitly
    // rather than rely on there being exactly one.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    let (command, startup) = cli.command();

    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(dispatch_and_report(command, startup));
    std::process::exit(code);
}

async fn dispatch_and_report(command: Command, startup: bool) -> i32 {
    match dispatch(command, startup).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if is_configuration_error(&err) { EXIT_CONFIG_INVALID } else { EXIT_GENERIC }
        },
    }
}

/// `true` for startup failures spec.md §7 classifies as `Configuration`
/// (fatal, exit code 3): a `CoreError::Configuration` anywhere in the
/// error chain, or the listener port already being bound by another
/// process.
fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<pclink_core::CoreError>(),
            Some(pclink_core::CoreError::Configuration(_))
        ) || matches!(
            cause.downcast_ref::<std::io::Error>(),
            Some(e) if e.kind() == std::io::ErrorKind::AddrInUse
        )
    })
}

async fn dispatch(command: Command, startup: bool) -> anyhow::Result<i32> {
    let data_dir = paths::data_dir()?;
    std::fs::create_dir_all(&data_dir)?;

    match command {
        Command::Start => start(&data_dir, startup).await,
        Command::Stop => stop(&data_dir),
        Command::Restart => restart(&data_dir),
        Command::Status => status(&data_dir).await,
        Command::Logs { lines } => logs(&data_dir, lines),
        Command::Qr => qr(&data_dir),
        Command::Setup => setup(&data_dir).await,
        Command::Pair { name } => pair(&data_dir, &name).await,
    }
}

async fn start(data_dir: &Path, startup: bool) -> anyhow::Result<i32> {
    let lock_path = paths::lock_file(data_dir);
    let Some(_lock) = InstanceLock::try_acquire(&lock_path)? else {
        eprintln!("pclink is already running under data dir {}", data_dir.display());
        return Ok(EXIT_ALREADY_RUNNING);
    };

    let _log_guard = logging::init(data_dir, startup)?;
    info!(data_dir = %data_dir.display(), "starting pclink");

    let identity = Arc::new(ServerIdentity::load_or_init(data_dir)?);
    let devices = Arc::new(DeviceRegistry::load_or_init(
        &paths::devices_file(data_dir),
        identity.clone(),
    )?);

    let config = Config::load_or_init(&paths::config_file(data_dir))?;
    if let Err(err) = config.validate() {
        error!(error = %err, "invalid configuration, refusing to start");
        return Ok(EXIT_CONFIG_INVALID);
    }

    let transfers = Arc::new(TransferEngine::load_or_init(
        &paths::transfers_dir(data_dir),
        config.transfer.clone(),
    )?);
    let pairing = Arc::new(PairingBroker::new(
        config.rate_limit.pairing_max_attempts,
        config.rate_limit.pairing_window,
        1000,
    ));
    let hub = Arc::new(SessionHub::new());
    let operator_auth = Arc::new(OperatorAuth::from_hash(config.operator_password_hash.clone()));
    let login_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.login_max_attempts,
        config.rate_limit.login_window,
        1000,
    ));
    let listener = Arc::new(ListenerControl::new());
    let listen_port = config.listen_port;
    let config_path = Arc::new(paths::config_file(data_dir));
    let config = Arc::new(RwLock::new(config));

    let state = AppState::new(
        identity.clone(),
        devices,
        pairing,
        hub,
        operator_auth,
        transfers.clone(),
        login_limiter,
        config.clone(),
        config_path,
        listener.clone(),
    );

    let app = pclink_web::build_router(state);
    let tls_config = RustlsConfig::from_pem(
        identity.cert_pem.clone().into_bytes(),
        identity.key_pem.clone().into_bytes(),
    )
    .await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));

    let cleanup_task = tokio::spawn(cleanup::run_periodic(
        transfers,
        CLEANUP_SWEEP_INTERVAL,
        listener.shutdown_receiver(),
    ));
    let discovery_task = tokio::spawn(discovery_supervisor(
        config.clone(),
        identity,
        listener.shutdown_receiver(),
    ));
    let signal_task = tokio::spawn(wait_for_shutdown_signal(listener.clone()));

    let outcome = serve::run(addr, tls_config, app, listener.desired_receiver(), listener.shutdown_receiver()).await;

    cleanup_task.abort();
    discovery_task.abort();
    signal_task.abort();

    outcome?;
    info!("pclink stopped");
    Ok(EXIT_OK)
}

/// Starts and stops the discovery beacon as `setup_complete` toggles
/// (spec.md §4.5 "beacon stops while the operator has not completed
/// first-time setup ... resumes once setup completes").
async fn discovery_supervisor(
    config: Arc<RwLock<Config>>,
    identity: Arc<ServerIdentity>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut beacon: Option<tokio::task::JoinHandle<()>> = None;
    let mut ticker = tokio::time::interval(DISCOVERY_SUPERVISOR_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (setup_complete, port, https_port, interval) = {
                    let cfg = config.read().await;
                    (cfg.setup_complete, cfg.discovery.port, cfg.listen_port, cfg.discovery.interval)
                };
                match (setup_complete, beacon.is_some()) {
                    (true, false) => {
                        let hostname = gethostname();
                        let fingerprint = identity.cert_fingerprint.clone();
                        let beacon_shutdown = shutdown.clone();
                        beacon = Some(tokio::spawn(pclink_core::discovery::run(
                            port,
                            interval,
                            hostname,
                            https_port,
                            fingerprint,
                            beacon_shutdown,
                        )));
                    },
                    (false, true) => {
                        if let Some(handle) = beacon.take() {
                            handle.abort();
                        }
                    },
                    _ => {},
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Some(handle) = beacon.take() {
                        handle.abort();
                    }
                    return;
                }
            }
        }
    }
}

fn gethostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "pclink-host".to_string())
}

/// Waits for Ctrl+C or, on Unix, `SIGTERM`, then signals full-process
/// shutdown through `listener`.
async fn wait_for_shutdown_signal(listener: Arc<ListenerControl>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    listener.shutdown();
}

fn stop(data_dir: &Path) -> anyhow::Result<i32> {
    let Some(pid) = InstanceLock::read_pid(&paths::lock_file(data_dir)) else {
        println!("pclink is not running");
        return Ok(EXIT_OK);
    };

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()?;
        if status.success() {
            println!("sent shutdown signal to pclink (pid {pid})");
        } else {
            println!("pclink (pid {pid}) was not running");
        }
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stopping a running daemon (pid {pid}) is not implemented on this platform");
    }

    Ok(EXIT_OK)
}

fn restart(data_dir: &Path) -> anyhow::Result<i32> {
    stop(data_dir)?;

    let lock_path = paths::lock_file(data_dir);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if let Some(lock) = InstanceLock::try_acquire(&lock_path)? {
            drop(lock);
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let exe = std::env::current_exe()?;
    std::process::Command::new(exe).arg("start").spawn()?;
    println!("pclink restarted");
    Ok(EXIT_OK)
}

async fn status(data_dir: &Path) -> anyhow::Result<i32> {
    let Some(pid) = InstanceLock::read_pid(&paths::lock_file(data_dir)) else {
        println!("pclink is not running");
        return Ok(EXIT_OK);
    };

    let config = Config::load_or_init(&paths::config_file(data_dir))?;
    print!("pclink is running (pid {pid}, port {})", config.listen_port);
    match client::probe_status(config.listen_port).await {
        Some(body) => println!(", reachable: {body}"),
        None => println!(", not yet reachable on its TLS port"),
    }
    Ok(EXIT_OK)
}

fn logs(data_dir: &Path, lines: usize) -> anyhow::Result<i32> {
    let log_dir = data_dir.join("logs");
    let mut files: Vec<_> = std::fs::read_dir(&log_dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("pclink.log"))
        })
        .collect();
    files.sort();

    let Some(latest) = files.last() else {
        println!("no logs yet at {}", log_dir.display());
        return Ok(EXIT_OK);
    };

    let contents = std::fs::read_to_string(latest)?;
    let tail: Vec<_> = contents.lines().rev().take(lines).collect();
    for line in tail.into_iter().rev() {
        println!("{line}");
    }
    Ok(EXIT_OK)
}

#[derive(serde::Serialize)]
struct QrPayload {
    ip: String,
    port: u16,
    protocol: &'static str,
    api_key: String,
    cert_fingerprint: String,
}

fn qr(data_dir: &Path) -> anyhow::Result<i32> {
    let config = Config::load_or_init(&paths::config_file(data_dir))?;
    if !config.setup_complete {
        println!("first-time setup has not completed; run `pclink setup` first");
        return Ok(EXIT_GENERIC);
    }

    let identity = ServerIdentity::load_or_init(data_dir)?;
    let ip = pclink_core::identity::local_non_virtual_ipv4_addrs()
        .into_iter()
        .next()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let payload = QrPayload {
        ip,
        port: config.listen_port,
        protocol: "https",
        api_key: identity.api_key,
        cert_fingerprint: identity.cert_fingerprint,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(EXIT_OK)
}

async fn setup(data_dir: &Path) -> anyhow::Result<i32> {
    let config_path = paths::config_file(data_dir);
    let mut config = Config::load_or_init(&config_path)?;
    if config.setup_complete {
        println!("setup has already completed");
        return Ok(EXIT_OK);
    }

    let password = prompt_password("Set an operator password: ")?;
    let confirm = prompt_password("Confirm operator password: ")?;
    if password != confirm {
        anyhow::bail!("passwords did not match");
    }

    let auth = OperatorAuth::new();
    auth.set_password(&password).await?;
    config.operator_password_hash = auth.password_hash_snapshot().await;
    config.setup_complete = true;
    config.persist(&config_path)?;

    println!("operator password set; run `pclink` to start the daemon");
    Ok(EXIT_OK)
}

fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

async fn pair(data_dir: &Path, name: &str) -> anyhow::Result<i32> {
    let config = Config::load_or_init(&paths::config_file(data_dir))?;
    println!("requesting pairing as \"{name}\"; waiting for operator approval...");
    let approved = client::request_pairing(config.listen_port, name).await?;
    println!("paired. device api key: {}", approved.api_key);
    println!("certificate fingerprint: {}", approved.cert_fingerprint);
    Ok(EXIT_OK)
}
