//! Hello / Disconnect.

use std::collections::BTreeMap;

use tasknet_core::crypto;
use tasknet_core::message::{Disconnect, DisconnectReason, Hello, CLIENT_VERSION, PROTOCOL_ID};
use tasknet_core::task::NodeInfo;
use tasknet_core::Signed;

use super::{Session, SessionState};

impl Session {
    /// Open the conversation by sending our `Hello`. The peer may also
    /// speak first; either order completes the handshake.
    pub fn start(&mut self) {
        if self.state != SessionState::Init {
            return;
        }
        self.state = SessionState::Handshaking;
        self.send_hello();
        self.publish();
    }

    pub(super) fn local_node_info(&self) -> NodeInfo {
        NodeInfo {
            key: self.ctx.keypair.public,
            node_name: self.ctx.config.node_name.clone(),
            pub_addr: self.ctx.config.public_addr.clone(),
            pub_port: self.ctx.config.public_port,
        }
    }

    fn send_hello(&mut self) {
        let hello = Hello {
            rand_val: self.rand_val,
            proto_id: PROTOCOL_ID,
            node_info: self.local_node_info(),
            client_ver: CLIENT_VERSION.to_string(),
            client_key_id: self.ctx.keypair.public,
            port: self.ctx.config.public_port,
            metadata: BTreeMap::new(),
        };
        if let Some(msg) = self.sign(hello) {
            self.hello_sent = true;
            self.send(msg.into());
        }
    }

    pub(super) fn on_hello(&mut self, msg: Signed<Hello>) {
        let key = msg.body.client_key_id;

        if msg.body.proto_id != PROTOCOL_ID {
            tracing::warn!(
                session = self.id,
                theirs = msg.body.proto_id,
                ours = PROTOCOL_ID,
                "protocol id mismatch"
            );
            self.disconnect(DisconnectReason::ProtocolVersion);
            return;
        }
        if !crypto::is_key_difficult(&key, self.ctx.config.key_difficulty) {
            tracing::warn!(
                session = self.id,
                difficulty = crypto::key_difficulty(&key),
                required = self.ctx.config.key_difficulty,
                "peer key not difficult enough"
            );
            self.disconnect(DisconnectReason::KeyNotDifficult);
            return;
        }
        if msg.body.node_info.key != key {
            tracing::warn!(session = self.id, "hello node info names a different key");
            self.disconnect(DisconnectReason::BadProtocol);
            return;
        }
        if let Some(peer) = self.peer {
            if peer != key {
                tracing::warn!(session = self.id, "second hello from a different key");
                self.disconnect(DisconnectReason::BadProtocol);
                return;
            }
        }

        self.peer = Some(key);
        self.peer_info = Some(msg.body.node_info);
        self.state = SessionState::Verified;
        tracing::info!(
            session = self.id,
            peer = %hex::encode(&key[..8]),
            client = %msg.body.client_ver,
            "session verified"
        );

        if !self.hello_sent {
            self.send_hello();
        }
        self.flush_queue();
        self.publish();
    }

    pub(super) fn on_disconnect(&mut self, msg: Signed<Disconnect>) {
        tracing::info!(session = self.id, reason = ?msg.body.reason, "peer disconnected");
        self.close();
    }

    /// Tell the peer why, then close.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        if let Some(msg) = self.sign(Disconnect { reason }) {
            self.send(msg.into());
        }
        self.close();
    }
}
