/**
 * VISIBLAZE KERNEL - Point d'entrée du backend compliance/inventaire
 *
 * RÔLE : Orchestration des modules : config, store, API HTTP.
 * Chemin d'écriture : agent -> validate -> reconcile -> store.
 * Chemin de lecture : dashboard -> query handlers -> store.
 * Les deux partagent le store mais jamais leurs verrous au-delà du
 * commit atomique d'un hôte.
 */

mod config;
mod http;
mod models;
mod reconcile;
mod store;
mod validate;

use crate::config::load_config;
use crate::http::AppState;
use crate::store::{Store, StoreConfig};

use anyhow::Result;
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel (clé API, chemin config)
    dotenvy::dotenv().ok();
    env_logger::init();

    let cfg = load_config().await;

    let store = Store::open(StoreConfig {
        data_dir: cfg.data_dir.clone().into(),
        cis_history_limit: cfg.cis_history_limit,
        retry_attempts: cfg.write_retry.attempts,
        retry_backoff_ms: cfg.write_retry.backoff_ms,
    })?;

    let app_state = AppState {
        store: Arc::new(store),
        cfg: cfg.clone(),
        started: Instant::now(),
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.bind_port));
    info!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
