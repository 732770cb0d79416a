//! Outbound sessions.
//!
//! Dials the configured bootstrap peers once at startup, then dials task
//! owners on demand: each header received on the offer channel is turned
//! into a `WantToComputeTask` on a session with the header's owner, reusing
//! a live session to the same address.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use tasknet_core::task::TaskHeader;
use tasknet_core::Signed;
use tasknet_services::{SessionContext, SessionEvent, SessionHandle};

use super::spawn_session;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SessionInitiator {
    ctx: SessionContext,
    bootstrap: Vec<String>,
    offers: mpsc::UnboundedReceiver<Signed<TaskHeader>>,
    shutdown: broadcast::Receiver<()>,
    /// address → session
    sessions: HashMap<String, SessionHandle>,
}

impl SessionInitiator {
    pub fn new(
        ctx: SessionContext,
        bootstrap: Vec<String>,
        offers: mpsc::UnboundedReceiver<Signed<TaskHeader>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            ctx,
            bootstrap,
            offers,
            shutdown,
            sessions: HashMap::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        for addr in std::mem::take(&mut self.bootstrap) {
            if let Err(e) = self.session_to(&addr).await {
                tracing::warn!(addr = %addr, error = %e, "bootstrap peer unreachable");
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session initiator shutting down");
                    return Ok(());
                }

                header = self.offers.recv() => {
                    let Some(header) = header else {
                        return Ok(());
                    };
                    self.offer(header).await;
                }
            }
        }
    }

    async fn offer(&mut self, header: Signed<TaskHeader>) {
        let owner = &header.body.task_owner;
        let task_id = header.body.task_id.clone();
        if !owner.is_reachable() {
            tracing::warn!(task = %task_id, owner = %owner.key_id(), "task owner advertises no address");
            return;
        }
        let addr = format!(
            "{}:{}",
            owner.pub_addr.as_deref().unwrap_or_default(),
            owner.pub_port.unwrap_or_default()
        );
        match self.session_to(&addr).await {
            Ok(session) => {
                if !session.send(SessionEvent::RequestTask(header)) {
                    tracing::warn!(task = %task_id, addr = %addr, "session ended before the offer was sent");
                }
            }
            Err(e) => tracing::warn!(task = %task_id, addr = %addr, error = %e, "failed to reach task owner"),
        }
    }

    async fn session_to(&mut self, addr: &str) -> Result<SessionHandle> {
        if let Some(handle) = self.sessions.get(addr).filter(|h| h.is_alive()) {
            return Ok(handle.clone());
        }
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .with_context(|| format!("connect to {addr} failed"))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).ok();
        let handle = spawn_session(self.ctx.clone(), stream, peer_addr, true);
        self.sessions.insert(addr.to_string(), handle.clone());
        Ok(handle)
    }
}
