//! The `delve` binary: a headless client that signs in, fetches the
//! slot, gem and mission lists, and logs every update until Ctrl-C.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use delve_client::{ClientSettings, GameClient};
use delve_config::{CliArgs, Config};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            std::process::exit(1);
        }
    };
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&args);

    let log_dir: PathBuf = config_dir.join("logs");
    delve_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let token = args.token.clone().unwrap_or_default();
    if token.is_empty() {
        tracing::warn!("no token given (--token or DELVE_TOKEN); the server will likely refuse");
    }

    let mut client = GameClient::new(ClientSettings::from_config(&config, token));
    let shutdown = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    if let Err(e) = client.start(&shutdown).await {
        tracing::error!(error = %e, "could not start");
        std::process::exit(1);
    }

    if let Some(requests) = client.requests() {
        let sent = [
            requests.request_server_time(),
            requests.request_slot_list(),
            requests.request_gem_list(),
            requests.request_mission_list(),
        ];
        for result in sent {
            if let Err(e) = result {
                tracing::warn!(error = %e, "initial request not queued");
            }
        }
    }

    log_updates(&client, &shutdown).await;

    if let Err(e) = client.stop().await {
        tracing::error!(error = %e, "shutdown failed");
    }
    ctrl_c.abort();
}

/// Log notifications until `shutdown` fires.
async fn log_updates(client: &GameClient, shutdown: &CancellationToken) {
    let feeds = client.notifications();
    let caches = client.caches();
    let mut session = feeds.session.subscribe();
    let mut currency = feeds.currency.subscribe();
    let mut slots = feeds.slots_changed.subscribe();
    let mut gems = feeds.gems_changed.subscribe();
    let mut missions = feeds.missions_changed.subscribe();
    let mut slot_results = feeds.slot_results.subscribe();
    let mut discards = feeds.gem_discard.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = session.recv() => {
                if let Some(event) = received(event) {
                    tracing::info!(%event, "session");
                }
            }
            value = currency.recv() => {
                if let Some(c) = received(value) {
                    tracing::info!(gold = c.gold, crystal = c.crystal, "wallet");
                }
            }
            value = slots.recv() => {
                if received(value).is_some() {
                    let (count, dps) = caches.slots.read(|t| (t.len(), t.total_dps()));
                    tracing::info!(count, dps, "slots");
                }
            }
            value = gems.recv() => {
                if received(value).is_some() {
                    let (owned, equipped) = caches.inventory.read(|inv| {
                        (inv.len(), inv.iter().filter(|g| inv.is_equipped(&g.instance_id)).count())
                    });
                    tracing::info!(owned, equipped, "gems");
                }
            }
            value = missions.recv() => {
                if received(value).is_some() {
                    let (active, claimable) =
                        caches.missions.read(|b| (b.len(), b.claimable().count()));
                    tracing::info!(active, claimable, "missions");
                }
            }
            value = slot_results.recv() => {
                if let Some(result) = received(value) {
                    tracing::info!(success = result.success, error = ?result.error, "slot operation");
                }
            }
            value = discards.recv() => {
                if let Some(outcome) = received(value) {
                    tracing::info!(
                        success = outcome.result.success,
                        discarded = outcome.consumed.len(),
                        "discard"
                    );
                }
            }
        }
    }
}

/// Unwrap a feed value. Lag is logged and skipped.
fn received<T>(value: Result<T, broadcast::error::RecvError>) -> Option<T> {
    match value {
        Ok(value) => Some(value),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "notification feed lagged");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}
