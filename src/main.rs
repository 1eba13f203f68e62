//! Beacon - geofenced emergency alert fanout.
//!
//! # Overview
//!
//! One SOS event in, two concurrent branches out: a realtime broadcast to
//! live map observers and a batched multicast push to every registered
//! device within 500 m, reported back with per-alert delivery accounting.
//!
//! # API Endpoints
//!
//! - `POST /alerts` - Trigger the fanout for one emergency event
//! - `POST /devices` - Register or refresh a device token and position
//! - `POST /identity/token` - Issue a rank-annotated identity token
//! - `GET /health` - Health check

use std::env;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use beacon::api::{AppState, router};
use beacon::broadcast::ChannelPublisher;
use beacon::identity::TokenIssuer;
use beacon::push::FcmClient;
use beacon::storage::Storage;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:beacon.db?mode=rwc";

/// Broadcast channel depth per lagging observer.
const BROADCAST_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("beacon=info".parse()?))
        .init();

    // Load configuration from environment
    let port: u16 = env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("BEACON_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let server_key = env::var("BEACON_FCM_SERVER_KEY").unwrap_or_default();
    if server_key.is_empty() {
        warn!("BEACON_FCM_SERVER_KEY not set; push dispatch will be unavailable");
    }

    let provider = match env::var("BEACON_FCM_URL") {
        Ok(url) => FcmClient::with_base_url(&url, &server_key),
        Err(_) => FcmClient::new(&server_key),
    };

    let issuer = match env::var("BEACON_SIGNING_SEED").ok().and_then(|s| parse_seed(&s)) {
        Some(seed) => TokenIssuer::from_seed(&seed),
        None => {
            warn!("BEACON_SIGNING_SEED missing or invalid; using an ephemeral signing key");
            TokenIssuer::generate()
        }
    };

    info!(port, db_url = %db_url, "Starting Beacon server");

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let state = AppState {
        storage,
        publisher: ChannelPublisher::new(BROADCAST_CAPACITY),
        provider,
        issuer,
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Beacon is listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Parse a 64-character hex string into a 32-byte signing seed.
/// Anything else, including non-ASCII input, yields `None` so the caller
/// falls back to an ephemeral key.
fn parse_seed(hex: &str) -> Option<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return None;
    }
    let mut seed = [0u8; 32];
    for (i, byte) in seed.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_valid_hex() {
        let seed = parse_seed(&"ab".repeat(32)).unwrap();
        assert_eq!(seed, [0xab; 32]);
    }

    #[test]
    fn test_parse_seed_rejects_bad_input() {
        assert!(parse_seed("").is_none());
        assert!(parse_seed(&"ab".repeat(16)).is_none());
        assert!(parse_seed(&"zz".repeat(32)).is_none());
        // 64 bytes of non-ASCII must not panic on slicing
        assert!(parse_seed(&"\u{e9}".repeat(32)).is_none());
    }
}
