//! TLS accept loop bound to [`pclink_core::listener::ListenerControl`]
//! (spec.md §4.8, §5).
//!
//! The HTTP handlers in `pclink-web` only ever express listener intent;
//! this loop owns the actual socket and reacts to
//! `ListenerControl::desired_receiver`/`shutdown_receiver`, rebinding on
//! every `Running` transition and tearing the bound server down
//! (gracefully, draining in-flight requests) on `Stopped` or process
//! shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::watch;
use tracing::info;

use pclink_core::listener::ListenerState;

const GRACEFUL_SHUTDOWN_WINDOW: Duration = Duration::from_secs(5);

/// Drive the accept loop until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the bind/serve task fails or panics — most
/// commonly the configured port already being bound by a foreign
/// process (spec.md §7 "Configuration: ... port already bound").
pub async fn run(
    addr: SocketAddr,
    tls_config: RustlsConfig,
    app: Router,
    mut desired: watch::Receiver<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        if *desired.borrow() != ListenerState::Running {
            tokio::select! {
                _ = desired.changed() => continue,
                _ = shutdown.changed() => continue,
            }
        }

        info!(%addr, "listener binding");
        let handle = axum_server::Handle::new();
        let mut server = tokio::spawn(
            axum_server::bind_rustls(addr, tls_config.clone())
                .handle(handle.clone())
                .serve(app.clone().into_make_service()),
        );

        let outcome = loop {
            tokio::select! {
                result = &mut server => break result,
                changed = desired.changed() => {
                    if changed.is_err() || *desired.borrow() != ListenerState::Running {
                        handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_WINDOW));
                        break (&mut server).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_WINDOW));
                        break (&mut server).await;
                    }
                }
            }
        };

        info!("listener unbound");
        match outcome {
            Ok(Ok(())) => {},
            Ok(Err(err)) => return Err(anyhow::Error::new(err).context("listener bind/serve failed")),
            Err(join_err) => return Err(anyhow::Error::new(join_err).context("listener task panicked")),
        }

        if *shutdown.borrow() {
            return Ok(());
        }
    }
}
