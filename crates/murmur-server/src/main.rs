//! # murmur-server
//!
//! Real-time chat backend for the murmur network.
//!
//! This binary provides:
//! - **Presence registry** tracking every live connection per user, so a
//!   second tab never flips a user offline
//! - **Delivery state machine** advancing each message sent -> delivered ->
//!   seen, with sweeps on reconnect
//! - **Membership state machine** for group invites, joins, departures and
//!   admin succession
//! - **WebSocket transport** (`/ws`) for typing, seen acknowledgments and
//!   server pushes
//! - **REST API** (axum) for users, friendships, messages and conversations

mod api;
mod config;
mod delivery;
mod directory;
mod error;
mod membership;
mod presence;
mod resolver;
mod router;
mod ws;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use murmur_store::Database;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

/// The store handle shared by every service. Holding the lock makes a
/// read-modify-write against the store atomic.
pub type SharedDb = Arc<Mutex<Database>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting murmur server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store (runs pending migrations)
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database ready");

    // -----------------------------------------------------------------------
    // 4. Wire services
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState::new(db, config);

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
