//! tasknetd: task network node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tasknet_core::config::TasknetConfig;
use tasknet_core::task::TaskHeader;
use tasknet_core::Signed;
use tasknet_services::directory::SessionDirectory;
use tasknet_services::session::SessionConfig;
use tasknet_services::{
    EscalationService, LocalNode, MessageHistory, SessionContext, Stores, SubtaskLedger, TaskBoard,
};

mod arbiter;
mod history_db;
mod identity;
mod session;

use history_db::HistoryDb;

/// How long the local compute engine takes per subtask.
const COMPUTE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TasknetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TasknetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TasknetConfig::default()
    });
    tracing::info!(
        node_name = %config.identity.node_name,
        listen_port = config.network.listen_port,
        concent = config.concent.enabled,
        "tasknetd starting"
    );

    // Keypair
    let keypair = Arc::new(identity::load_or_generate(
        &config.identity.keypair_path,
        config.protocol.key_difficulty,
    )?);
    tracing::info!(public_key = keypair.key_id(), "keypair ready");

    // History, optionally mirrored to SQLite and reloaded
    let db = if config.history.persist {
        let db = HistoryDb::open(&config.history.db_path)?;
        tracing::info!(path = %config.history.db_path.display(), "history database open");
        Some(Arc::new(db))
    } else {
        None
    };
    let history = match &db {
        Some(db) => {
            let history = MessageHistory::with_sink(db.clone());
            let loaded = db.load_into(&history).context("failed to reload history")?;
            tracing::info!(records = loaded, "history reloaded");
            history
        }
        None => MessageHistory::new(),
    };

    // Shared state
    let directory = SessionDirectory::new();
    let stores = Stores {
        history,
        ledger: SubtaskLedger::new(),
        directory: directory.clone(),
        escalation: EscalationService::new(
            config.concent.enabled,
            Arc::new(arbiter::ArbiterOutbox::new(db.clone())),
        ),
    };
    let board = TaskBoard::new();
    let local = Arc::new(LocalNode::new(board.clone(), directory, COMPUTE_DELAY));
    let session_config = Arc::new(SessionConfig::from_config(&config));
    if session_config.public_addr.is_none() {
        tracing::warn!("no public address configured, providers cannot reach our tasks");
    }

    let ctx = SessionContext {
        keypair: keypair.clone(),
        config: session_config.clone(),
        stores: stores.clone(),
        hooks: local.collaborators(),
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let bind = format!("{}:{}", config.network.bind_addr, config.network.listen_port);
    let tcp = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind session listener on {bind}"))?;
    tracing::info!(addr = %bind, "session listener bound");

    let session_listener_task = tokio::spawn(
        session::listener::SessionListener::new(tcp, ctx.clone(), shutdown_tx.subscribe()).run(),
    );

    let (offer_tx, offer_rx) = mpsc::unbounded_channel::<Signed<TaskHeader>>();
    let session_initiator_task = tokio::spawn(
        session::initiator::SessionInitiator::new(
            ctx,
            config.network.bootstrap_peers.clone(),
            offer_rx,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let session_printer = {
        let stores = stores.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let (accepted, rejected, open) = stores.ledger.counts();
                tracing::info!(
                    sessions = stores.directory.sessions().len(),
                    verified = stores.directory.verified_sessions(),
                    accepted,
                    rejected,
                    open,
                    "session table snapshot"
                );
            }
        })
    };

    // Status HTTP endpoint
    let api_port = config.network.api_port;
    let _status_server = {
        let state = tasknet_api::ApiState {
            keypair: keypair.clone(),
            config: session_config,
            stores,
            board,
            offers: offer_tx,
        };
        tokio::spawn(async move {
            if let Err(e) = tasknet_api::serve(state, api_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()       => tracing::info!("shutting down"),
        r = session_listener_task    => tracing::error!("session listener exited: {:?}", r),
        r = session_initiator_task   => tracing::error!("session initiator exited: {:?}", r),
        r = session_printer          => tracing::error!("session printer exited: {:?}", r),
    }

    Ok(())
}
