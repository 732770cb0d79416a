//! Inbound session listener.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tasknet_services::SessionContext;

use super::spawn_session;

pub struct SessionListener {
    listener: TcpListener,
    ctx: SessionContext,
    shutdown: broadcast::Receiver<()>,
}

impl SessionListener {
    pub fn new(listener: TcpListener, ctx: SessionContext, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            listener,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    spawn_session(self.ctx.clone(), stream, Some(addr.to_string()), false);
                }
            }
        }
    }
}
