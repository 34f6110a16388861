//! # parley-server
//!
//! Real-time chat server for Parley.
//!
//! This binary provides:
//! - **Conversation Router** that persists messages in order and fans them
//!   out with `sent → delivered → read` receipts
//! - **Presence Registry** and **Typing Coordinator**, in-memory and rebuilt
//!   empty on every start
//! - **WebSocket transport** (`/ws`) carrying JSON frames
//! - **REST API** (axum) for users, conversations, history and admin views
//! - **Per-IP and per-user rate limiting**
//! - An optional keyword **moderation hook** that flags messages after they
//!   are stored

mod api;
mod config;
mod error;
mod moderation;
mod presence;
mod rate_limit;
mod router;
mod tracker;
mod typing;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::{Database, StoreHandle};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::moderation::ModerationHook;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{RateLimiter, UserRateLimiter};
use crate::router::{ConversationRouter, RouterSettings};
use crate::typing::TypingCoordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the database
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    // Nobody is connected to a process that just started.
    let stale = db.reset_presence()?;
    if stale > 0 {
        info!(count = stale, "Cleared stale online flags");
    }
    let store = StoreHandle::new(db);

    // -----------------------------------------------------------------------
    // 4. Build the engine
    // -----------------------------------------------------------------------
    let presence = Arc::new(PresenceRegistry::new());
    let (typing, typing_changes) = TypingCoordinator::new(config.typing_timeout);

    let mut router = ConversationRouter::new(
        store.clone(),
        Arc::clone(&presence),
        Arc::new(typing),
        RouterSettings {
            max_message_len: config.max_message_len,
            history_page_limit: config.history_page_limit,
        },
    );
    if let Some(filter) = config.keyword_filter() {
        info!("Moderation hook enabled");
        router = router.with_moderation(ModerationHook::new(filter, store.clone()));
    }

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let user_limiter = UserRateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let http_addr = config.http_addr;
    let app_state = AppState {
        router: Arc::new(router),
        store: store.clone(),
        rate_limiter: rate_limiter.clone(),
        user_limiter: user_limiter.clone(),
        config: Arc::new(config),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Typing notifications
    tokio::spawn(typing::run_fanout(typing_changes, store, presence));

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(600.0).await;
            user_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server (blocks until shutdown)
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
