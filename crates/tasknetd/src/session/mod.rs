//! TCP sessions: accepting peers, dialing task owners, and wiring each
//! connection to its own protocol session task.

pub mod initiator;
pub mod listener;

use tokio::io::{AsyncRead, AsyncWrite};

use tasknet_services::transport::framed;
use tasknet_services::{Session, SessionContext, SessionHandle};

/// Start a session over `stream`. The initiating side sends `Hello` first.
pub fn spawn_session<S>(ctx: SessionContext, stream: S, peer_addr: Option<String>, initiate: bool) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (conn, reader) = framed(stream, peer_addr.clone());
    let (mut session, handle) = Session::new(ctx, conn);
    if initiate {
        session.start();
    }
    tracing::info!(session = session.id(), peer = ?peer_addr, initiate, "session opened");

    tokio::spawn(reader.run(handle.clone()));
    tokio::spawn(session.run());
    handle
}
