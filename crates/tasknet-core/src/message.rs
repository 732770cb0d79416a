//! Protocol messages exchanged between requestors, providers and the arbiter.
//!
//! Every message is a [`Signed`] envelope around a kind-specific body. The
//! signature covers the kind tag, timestamp, sender and the whole body,
//! including any signed messages embedded in it. Embedded messages are kept
//! by value, so re-encoding them reproduces the original bytes and the
//! original signature still verifies.
//!
//! Bodies only use ordered maps (`BTreeMap`, and `serde_json::Value` objects
//! which are BTreeMap-backed) so encoding is deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::crypto::{self, hex_bytes, Keypair, PublicKey, SignatureBytes};
use crate::task::{now_secs, ComputeTaskDef, NodeInfo, ResourcesOptions, TaskHeader};

/// Protocol identifier carried in `Hello`. Peers with a different id are
/// disconnected with `DisconnectReason::ProtocolVersion`.
pub const PROTOCOL_ID: u32 = 32;

/// Client version string advertised in `Hello`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix mixed into the bytes covered by `TaskToCompute::ethsig`, so the
/// payment signature can never be replayed as a message signature.
const ETHSIG_DOMAIN: &[u8] = b"tasknet.ethsig.v1";

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A message body with a stable kind tag.
///
/// The tag is part of the signed bytes. Task and subtask ids are exposed so
/// history, routing and logging never need to match on concrete kinds.
pub trait Body: Serialize + DeserializeOwned + Clone + fmt::Debug {
    const TAG: &'static str;

    fn task_id(&self) -> Option<&str> {
        None
    }

    fn subtask_id(&self) -> Option<&str> {
        None
    }
}

/// Signed envelope: who sent it, when, and proof that they did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signed<T> {
    /// Sender wall clock, unix seconds. Advisory.
    pub timestamp: u64,
    #[serde(with = "hex_bytes")]
    pub sender: PublicKey,
    pub body: T,
    #[serde(with = "hex_bytes::option")]
    pub signature: Option<SignatureBytes>,
}

#[derive(Serialize)]
struct SigningView<'a, T> {
    kind: &'static str,
    timestamp: u64,
    sender: String,
    body: &'a T,
}

impl<T: Body> Signed<T> {
    /// Wrap `body` without signing it. Only useful for building a message in
    /// steps before calling [`Signed::resign`].
    pub fn unsigned(body: T, sender: PublicKey) -> Self {
        Self {
            timestamp: now_secs(),
            sender,
            body,
            signature: None,
        }
    }

    pub fn sign(body: T, keypair: &Keypair) -> Result<Self, ProtocolError> {
        let mut msg = Self::unsigned(body, keypair.public);
        msg.resign(keypair)?;
        Ok(msg)
    }

    /// Recompute the signature after the body has been modified.
    pub fn resign(&mut self, keypair: &Keypair) -> Result<(), ProtocolError> {
        self.sender = keypair.public;
        self.signature = Some(keypair.sign(&self.signing_bytes()?));
        Ok(())
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let view = SigningView {
            kind: T::TAG,
            timestamp: self.timestamp,
            sender: hex::encode(self.sender),
            body: &self.body,
        };
        serde_json::to_vec(&view).map_err(ProtocolError::Encode)
    }

    /// True iff the message claims `claimed` as sender and carries a valid
    /// signature by that key over exactly this content.
    pub fn verify(&self, claimed: &PublicKey) -> bool {
        if &self.sender != claimed {
            return false;
        }
        let Some(signature) = &self.signature else {
            return false;
        };
        match self.signing_bytes() {
            Ok(bytes) => crypto::verify(claimed, &bytes, signature),
            Err(_) => false,
        }
    }

    pub fn sender_id(&self) -> String {
        hex::encode(self.sender)
    }
}

impl<T> Deref for Signed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.body
    }
}

/// `deserialize_with` for optional fields that must still be present on the
/// wire (as `null` when empty). Plain `Option` fields would silently default.
pub fn explicit_null<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d)
}

// ── Reasons ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    ProtocolVersion,
    KeyNotDifficult,
    BadProtocol,
    Timeout,
    Refresh,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CannotAssignReason {
    NotMyTask,
    WrongKey,
    WrongAddress,
    ResourcesTooBig,
    WrongEnvironment,
    WrongDockerImages,
    NoMoreSubtasks,
    PriceTooHigh,
    TaskFinished,
    /// Reason given by the acceptance policy.
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CannotComputeReason {
    WrongCTD,
    WrongKey,
    WrongAddress,
    ResourcesTooBig,
    WrongEnvironment,
    WrongDockerImages,
    OfferCancelled,
    ConcentDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReportReason {
    SubtaskTimeLimitExceeded,
    GotMessageCannotComputeTask,
    GotMessageTaskFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultsRejectedReason {
    VerificationNegative,
    ResourcesFailure,
    ConcentVerificationNegative,
}

// ── Bodies ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub rand_val: u64,
    pub proto_id: u32,
    pub node_info: NodeInfo,
    pub client_ver: String,
    #[serde(with = "hex_bytes")]
    pub client_key_id: PublicKey,
    #[serde(deserialize_with = "explicit_null")]
    pub port: Option<u16>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Body for Hello {
    const TAG: &'static str = "Hello";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: DisconnectReason,
}

impl Body for Disconnect {
    const TAG: &'static str = "Disconnect";
}

impl Body for TaskHeader {
    const TAG: &'static str = "TaskHeader";

    fn task_id(&self) -> Option<&str> {
        Some(&self.task_id)
    }
}

/// Provider's offer to compute a subtask of an advertised task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WantToComputeTask {
    /// The requestor-signed header, exactly as advertised.
    pub task_header: Signed<TaskHeader>,
    pub perf_index: f64,
    pub price: u64,
    pub max_resource_size: u64,
    pub max_memory_size: u64,
    pub node_name: String,
    #[serde(with = "hex_bytes")]
    pub provider_public_key: PublicKey,
    pub concent_enabled: bool,
}

impl Body for WantToComputeTask {
    const TAG: &'static str = "WantToComputeTask";

    fn task_id(&self) -> Option<&str> {
        Some(&self.task_header.body.task_id)
    }
}

/// The binding commitment: this provider computes this subtask at this price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskToCompute {
    #[serde(deserialize_with = "explicit_null")]
    pub compute_task_def: Option<ComputeTaskDef>,
    /// The provider's offer, embedded unchanged.
    pub want_to_compute_task: Signed<WantToComputeTask>,
    pub requestor_id: String,
    #[serde(with = "hex_bytes")]
    pub requestor_public_key: PublicKey,
    #[serde(with = "hex_bytes")]
    pub requestor_ethereum_public_key: PublicKey,
    pub price: u64,
    pub package_hash: String,
    pub size: u64,
    pub concent_enabled: bool,
    #[serde(deserialize_with = "explicit_null")]
    pub resources_options: Option<ResourcesOptions>,
    /// Payment authorisation by the requestor's ethereum key.
    #[serde(with = "hex_bytes::option")]
    pub ethsig: Option<SignatureBytes>,
}

impl TaskToCompute {
    pub fn provider_public_key(&self) -> &PublicKey {
        &self.want_to_compute_task.body.provider_public_key
    }
}

impl Body for TaskToCompute {
    const TAG: &'static str = "TaskToCompute";

    fn task_id(&self) -> Option<&str> {
        match &self.compute_task_def {
            Some(ctd) => Some(&ctd.task_id),
            None => self.want_to_compute_task.body.task_id(),
        }
    }

    fn subtask_id(&self) -> Option<&str> {
        self.compute_task_def.as_ref().map(|ctd| ctd.subtask_id.as_str())
    }
}

impl Signed<TaskToCompute> {
    fn ethsig_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut stripped = self.clone();
        stripped.body.ethsig = None;
        let mut bytes = ETHSIG_DOMAIN.to_vec();
        bytes.extend(stripped.signing_bytes()?);
        Ok(bytes)
    }

    /// Sign with `ethsig` attached. `keypair` signs both the payment
    /// authorisation and the envelope; its public key must already be in
    /// `requestor_ethereum_public_key`.
    pub fn sign_with_ethsig(body: TaskToCompute, keypair: &Keypair) -> Result<Self, ProtocolError> {
        let mut msg = Self::unsigned(body, keypair.public);
        let ethsig = keypair.sign(&msg.ethsig_bytes()?);
        msg.body.ethsig = Some(ethsig);
        msg.resign(keypair)?;
        Ok(msg)
    }

    pub fn verify_ethsig(&self) -> bool {
        let Some(ethsig) = &self.body.ethsig else {
            return false;
        };
        match self.ethsig_bytes() {
            Ok(bytes) => crypto::verify(&self.body.requestor_ethereum_public_key, &bytes, ethsig),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CannotAssignTask {
    pub task_id: String,
    pub reason: CannotAssignReason,
}

impl Body for CannotAssignTask {
    const TAG: &'static str = "CannotAssignTask";

    fn task_id(&self) -> Option<&str> {
        Some(&self.task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CannotComputeTask {
    pub task_to_compute: Signed<TaskToCompute>,
    pub reason: CannotComputeReason,
}

impl Body for CannotComputeTask {
    const TAG: &'static str = "CannotComputeTask";

    fn task_id(&self) -> Option<&str> {
        self.task_to_compute.body.task_id()
    }

    fn subtask_id(&self) -> Option<&str> {
        self.task_to_compute.body.subtask_id()
    }
}

/// Provider's claim that a subtask is done and where to fetch the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportComputedTask {
    pub subtask_id: String,
    pub task_to_compute: Signed<TaskToCompute>,
    pub node_name: String,
    pub address: String,
    pub port: u16,
    pub node_info: NodeInfo,
    pub package_hash: String,
    pub multihash: String,
    pub secret: String,
    pub size: u64,
    pub extra_data: BTreeMap<String, serde_json::Value>,
}

impl Body for ReportComputedTask {
    const TAG: &'static str = "ReportComputedTask";

    fn task_id(&self) -> Option<&str> {
        self.task_to_compute.body.task_id()
    }

    fn subtask_id(&self) -> Option<&str> {
        Some(&self.subtask_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckReportComputedTask {
    pub report_computed_task: Signed<ReportComputedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectReportComputedTask {
    pub attached_task_to_compute: Signed<TaskToCompute>,
    pub reason: RejectReportReason,
}

impl Body for RejectReportComputedTask {
    const TAG: &'static str = "RejectReportComputedTask";

    fn task_id(&self) -> Option<&str> {
        self.attached_task_to_compute.body.task_id()
    }

    fn subtask_id(&self) -> Option<&str> {
        self.attached_task_to_compute.body.subtask_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResultsAccepted {
    pub report_computed_task: Signed<ReportComputedTask>,
    /// When the requestor committed to pay, unix seconds.
    pub payment_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResultsRejected {
    pub report_computed_task: Signed<ReportComputedTask>,
    pub reason: ResultsRejectedReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingForResults {
    pub task_id: String,
    pub subtask_id: String,
}

impl Body for WaitingForResults {
    const TAG: &'static str = "WaitingForResults";

    fn task_id(&self) -> Option<&str> {
        Some(&self.task_id)
    }

    fn subtask_id(&self) -> Option<&str> {
        Some(&self.subtask_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceGetTaskResult {
    pub report_computed_task: Signed<ReportComputedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceReportComputedTask {
    pub report_computed_task: Signed<ReportComputedTask>,
    pub result_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceSubtaskResults {
    pub ack_report_computed_task: Signed<AckReportComputedTask>,
}

impl Body for ForceSubtaskResults {
    const TAG: &'static str = "ForceSubtaskResults";

    fn task_id(&self) -> Option<&str> {
        self.ack_report_computed_task.body.task_id()
    }

    fn subtask_id(&self) -> Option<&str> {
        self.ack_report_computed_task.body.subtask_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResultsVerify {
    pub subtask_results_rejected: Signed<SubtaskResultsRejected>,
}

impl Body for SubtaskResultsVerify {
    const TAG: &'static str = "SubtaskResultsVerify";

    fn task_id(&self) -> Option<&str> {
        self.subtask_results_rejected.body.task_id()
    }

    fn subtask_id(&self) -> Option<&str> {
        self.subtask_results_rejected.body.subtask_id()
    }
}

/// Bodies that wrap a `report_computed_task` and take their ids from it.
macro_rules! wraps_report {
    ($($kind:ident),+ $(,)?) => {$(
        impl Body for $kind {
            const TAG: &'static str = stringify!($kind);

            fn task_id(&self) -> Option<&str> {
                self.report_computed_task.body.task_id()
            }

            fn subtask_id(&self) -> Option<&str> {
                self.report_computed_task.body.subtask_id()
            }
        }
    )+};
}

wraps_report!(
    AckReportComputedTask,
    SubtaskResultsAccepted,
    SubtaskResultsRejected,
    ForceGetTaskResult,
    ForceReportComputedTask,
);

// ── Closed message set ────────────────────────────────────────────────────────

macro_rules! protocol_messages {
    ($($kind:ident = $code:literal),+ $(,)?) => {
        /// Message kind discriminator; the byte carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum MessageKind {
            $($kind = $code),+
        }

        impl MessageKind {
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$kind),+];

            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($code => Some(Self::$kind),)+
                    _ => None,
                }
            }

            /// Class name. Used as the history and escalation key.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$kind => <$kind as Body>::TAG),+
                }
            }
        }

        /// Every message a peer may send.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "kind", content = "message")]
        pub enum Message {
            $($kind(Signed<$kind>)),+
        }

        impl Message {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Self::$kind(_) => MessageKind::$kind),+
                }
            }

            pub fn sender(&self) -> &PublicKey {
                match self {
                    $(Self::$kind(m) => &m.sender),+
                }
            }

            pub fn timestamp(&self) -> u64 {
                match self {
                    $(Self::$kind(m) => m.timestamp),+
                }
            }

            pub fn verify(&self, claimed: &PublicKey) -> bool {
                match self {
                    $(Self::$kind(m) => m.verify(claimed)),+
                }
            }

            pub fn task_id(&self) -> Option<&str> {
                match self {
                    $(Self::$kind(m) => m.body.task_id()),+
                }
            }

            pub fn subtask_id(&self) -> Option<&str> {
                match self {
                    $(Self::$kind(m) => m.body.subtask_id()),+
                }
            }
        }

        $(
            impl From<Signed<$kind>> for Message {
                fn from(m: Signed<$kind>) -> Self {
                    Self::$kind(m)
                }
            }
        )+
    };
}

protocol_messages! {
    Hello = 1,
    Disconnect = 2,
    WantToComputeTask = 3,
    TaskToCompute = 4,
    CannotAssignTask = 5,
    CannotComputeTask = 6,
    ReportComputedTask = 7,
    AckReportComputedTask = 8,
    RejectReportComputedTask = 9,
    SubtaskResultsAccepted = 10,
    SubtaskResultsRejected = 11,
    WaitingForResults = 12,
    ForceGetTaskResult = 20,
    ForceReportComputedTask = 21,
    ForceSubtaskResults = 22,
    SubtaskResultsVerify = 23,
}

impl MessageKind {
    /// Kinds a peer may send before the handshake completes.
    pub fn allowed_unverified(self) -> bool {
        matches!(self, Self::Hello | Self::Disconnect)
    }

    /// Kinds only ever sent to the arbiter, never to a peer.
    pub fn is_arbiter_facing(self) -> bool {
        matches!(
            self,
            Self::ForceGetTaskResult
                | Self::ForceReportComputedTask
                | Self::ForceSubtaskResults
                | Self::SubtaskResultsVerify
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }

    pub fn sender_id(&self) -> String {
        hex::encode(self.sender())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("frame header says {header} but body is {body}")]
    KindMismatch { header: MessageKind, body: MessageKind },

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    BadVersion(u8),

    #[error("frame body of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
