//! # medsync-watch
//!
//! Runs the sync engine headless and logs every settled update. Useful for
//! checking a Data Service deployment end to end.
//!
//! ## Environment
//! ```text
//! MEDSYNC_CONFIG        config file (default: platform config dir/medsync.toml)
//! MEDSYNC_ACCESS_TOKEN  session JWT; without it only link-shared scopes load
//! MEDSYNC_CALENDAR      calendar to watch, e.g. "owned:cal-1",
//!                       "shared_by_user:cal-9" or "shared_by_token:abc"
//! RUST_LOG              log filter (default: info)
//! ```

use std::path::PathBuf;

use medsync_core::{Scope, SourceKind};
use medsync_sync::{EngineConfig, SessionStore, SyncEngineBuilder};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = EngineConfig::load_or_default(std::env::var("MEDSYNC_CONFIG").ok().map(PathBuf::from));
    info!(
        api_url = %config.service.api_url,
        realtime_url = %config.service.realtime_url,
        "Configuration loaded"
    );

    let session = SessionStore::new();
    match std::env::var("MEDSYNC_ACCESS_TOKEN") {
        Ok(token) => session.sign_in(&token)?,
        Err(_) => warn!("MEDSYNC_ACCESS_TOKEN not set, identity data will not load"),
    }

    let mut engine = SyncEngineBuilder::new(config)
        .with_session(session)
        .build()?;
    engine.start()?;

    if let Ok(raw) = std::env::var("MEDSYNC_CALENDAR") {
        let scope = parse_calendar(&raw)?;
        info!(%scope, "Watching calendar");
        engine.select_calendar(Some(scope));
    }

    let mut loading = engine.subscribe_initial_loading();
    let mut calendars = engine.subscribe_calendars();
    let mut schedule = engine.subscribe_schedule();
    let mut notifications = engine.subscribe_notifications();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Ok(()) = loading.changed() => {
                info!(initial_loading = *loading.borrow_and_update(), "Loading state changed");
            }
            Ok(()) = calendars.changed() => {
                let count = calendars.borrow_and_update().as_ref().map(|c| c.len());
                info!(?count, "Calendars updated");
            }
            Ok(()) = schedule.changed() => {
                let days = schedule.borrow_and_update().as_ref().map(|s| s.days.len());
                info!(?days, "Schedule updated");
            }
            Ok(()) = notifications.changed() => {
                let unread = notifications
                    .borrow_and_update()
                    .as_ref()
                    .map(|n| n.iter().filter(|n| !n.read).count());
                info!(?unread, "Notifications updated");
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// `kind:key`, with a bare key meaning an owned calendar.
fn parse_calendar(raw: &str) -> Result<Scope, Box<dyn std::error::Error>> {
    let scope = match raw.split_once(':') {
        Some((kind, key)) => Scope::new(kind.parse::<SourceKind>()?, key)?,
        None => Scope::owned(raw)?,
    };
    Ok(scope)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
