//! The node-to-node message set.
//!
//! One payload struct per message; the `NodeMsg` enum ties each to its wire
//! tag. Tags are stable protocol surface: never renumber, only append.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use mist_types::{
    BlockId, ContextHash, Height, KernelId, MsgId, NodeId, Signature, SystemState, Timestamp,
    Transaction,
};

use crate::error::ProtoError;
use crate::flags::{ByeReason, IdType};

// ---------------------------------------------------------------------------
// Connection establishment
// ---------------------------------------------------------------------------

/// First message on the wire: the dialer's ephemeral X25519 public key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SChannelInitiate {
    pub ephemeral: [u8; 32],
}

/// The acceptor's ephemeral key; after this both sides hold the session key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SChannelReady {
    pub ephemeral: [u8; 32],
}

/// Proof of control of a long-term key: a signature over the channel
/// binding transcript (both ephemerals).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub node_id: NodeId,
    pub id_type: IdType,
    pub signature: Signature,
}

/// Capability and fork-height exchange; completes the handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub flags: u32,
    pub min_fork_height: Height,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bye {
    pub reason: ByeReason,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong;

// ---------------------------------------------------------------------------
// Chain data
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTip {
    pub state: SystemState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetHdr {
    pub id: BlockId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hdr {
    pub state: SystemState,
}

/// Request up to `count` headers ending at `top`, walking `prev` links.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetHdrPack {
    pub top: BlockId,
    pub count: u32,
}

/// Headers in ascending height order; the last one's id equals the
/// requested `top`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HdrPack {
    pub states: Vec<SystemState>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnumHdrs {
    pub from: Height,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBody {
    pub id: BlockId,
}

/// A block body split into the perishable part (spendable-era data that
/// fast-sync may drop) and the eternal part (kernels).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyBuffers {
    pub perishable: Vec<u8>,
    pub eternal: Vec<u8>,
}

impl BodyBuffers {
    pub fn len(&self) -> usize {
        self.perishable.len() + self.eternal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perishable.is_empty() && self.eternal.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub body: BodyBuffers,
}

/// Request bodies ending at `top` plus up to `count_extra` ancestors.
/// The horizon fields carry the requester's fast-sync cut-offs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBodyPack {
    pub top: BlockId,
    pub count_extra: u32,
    pub height_hard_lo: Height,
    pub height_txo_lo: Height,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyPack {
    pub bodies: Vec<BodyBuffers>,
}

/// The peer does not have the requested data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataMissing;

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub tx: Transaction,
    /// Dependent-context this transaction builds on, if any.
    pub context: Option<ContextHash>,
    /// True when the sender asks for immediate fluff (skip the stem phase).
    pub fluff: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HaveTransaction {
    pub id: KernelId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetTransaction {
    pub id: KernelId,
}

/// Announces a new dependent-chain link to subscribed peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetDependentContext {
    pub id: ContextHash,
    pub parent: ContextHash,
}

// ---------------------------------------------------------------------------
// Proof queries: answered by the chain processor; the node only routes.
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofState {
    pub height: Height,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofKernel {
    pub id: KernelId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofKernel2 {
    pub id: KernelId,
    /// Also return the full kernel, not just the inclusion proof.
    pub fetch: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofUtxo {
    pub coin: mist_types::CoinId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofShieldedOutp {
    pub serial: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofShieldedInp {
    pub serial: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetProofAsset {
    pub asset_id: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetShieldedList {
    pub from: u64,
    pub count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetProofChainWork;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetShieldedOutputsAt {
    pub height: Height,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetStateSummary;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetEvents {
    pub height_min: Height,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractVarsEnum {
    pub key_min: Vec<u8>,
    pub key_max: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractLogsEnum {
    pub height_min: Height,
    pub height_max: Height,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetContractVar {
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetContractLogProof {
    pub height: Height,
    pub idx: u32,
}

/// Opaque proof blob: the answer to every `GetProof*` query. An empty
/// proof is never sent; unsatisfiable queries get `DataMissing`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofData {
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub tip: BlockId,
    pub shielded_outputs: u64,
    pub shielded_inputs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Events {
    pub events: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShieldedList {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractVars {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractLogs {
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Peer exchange
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

/// A peer advertising the port it accepts connections on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfoSelf {
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetExternalAddr;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalAddr {
    pub addr: SocketAddr,
}

// ---------------------------------------------------------------------------
// BBS
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BbsMsg {
    pub channel: u32,
    pub time_posted: Timestamp,
    pub payload: Vec<u8>,
    /// Proof-of-work salt.
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BbsHaveMsg {
    pub id: MsgId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BbsGetMsg {
    pub id: MsgId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BbsSubscribe {
    pub channel: u32,
    pub time_from: Timestamp,
    pub on: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BbsResetSync {
    pub time_from: Timestamp,
}

// ---------------------------------------------------------------------------
// Mining finalization
// ---------------------------------------------------------------------------

/// Sent to the finalizer peer: complete a block template at `height`
/// carrying `fees` in collectable fees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetBlockFinalization {
    pub height: Height,
    pub fees: u64,
}

/// The finalizer's assembled coinbase transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockFinalization {
    pub tx: Transaction,
}

// ---------------------------------------------------------------------------
// The tagged message enum
// ---------------------------------------------------------------------------

macro_rules! define_messages {
    ($($tag:literal $variant:ident,)*) => {
        /// Every message that can travel between two mist nodes.
        #[derive(Clone, Debug, PartialEq)]
        pub enum NodeMsg {
            $($variant($variant),)*
        }

        impl NodeMsg {
            /// The 1-byte wire tag for this message.
            pub fn tag(&self) -> u8 {
                match self {
                    $(NodeMsg::$variant(_) => $tag,)*
                }
            }

            /// Message name for logging.
            pub fn name(&self) -> &'static str {
                match self {
                    $(NodeMsg::$variant(_) => stringify!($variant),)*
                }
            }

            /// Serialize the payload (without tag or length prefix).
            pub fn encode_payload(&self) -> Result<Vec<u8>, ProtoError> {
                match self {
                    $(NodeMsg::$variant(p) => Ok(bincode::serialize(p)?),)*
                }
            }

            /// Deserialize a payload for a given tag.
            pub fn decode_payload(tag: u8, payload: &[u8]) -> Result<NodeMsg, ProtoError> {
                match tag {
                    $($tag => Ok(NodeMsg::$variant(bincode::deserialize::<$variant>(payload)?)),)*
                    other => Err(ProtoError::UnknownTag(other)),
                }
            }
        }

        $(
            impl From<$variant> for NodeMsg {
                fn from(p: $variant) -> NodeMsg {
                    NodeMsg::$variant(p)
                }
            }
        )*
    };
}

define_messages! {
    0x01 SChannelInitiate,
    0x02 SChannelReady,
    0x03 Authentication,
    0x04 Login,
    0x05 Bye,
    0x06 Ping,
    0x07 Pong,

    0x10 NewTip,
    0x11 GetHdr,
    0x12 Hdr,
    0x13 GetHdrPack,
    0x14 HdrPack,
    0x15 EnumHdrs,
    0x16 GetBody,
    0x17 Body,
    0x18 GetBodyPack,
    0x19 BodyPack,
    0x1F DataMissing,

    0x20 NewTransaction,
    0x21 HaveTransaction,
    0x22 GetTransaction,
    0x23 SetDependentContext,

    0x30 GetProofState,
    0x31 GetProofKernel,
    0x32 GetProofKernel2,
    0x33 GetProofUtxo,
    0x34 GetProofShieldedOutp,
    0x35 GetProofShieldedInp,
    0x36 GetProofAsset,
    0x37 GetShieldedList,
    0x38 GetProofChainWork,
    0x39 GetShieldedOutputsAt,
    0x3A GetStateSummary,
    0x3B GetEvents,
    0x3C ContractVarsEnum,
    0x3D ContractLogsEnum,
    0x3E GetContractVar,
    0x3F GetContractLogProof,

    0x40 ProofData,
    0x41 StateSummary,
    0x42 Events,
    0x43 ShieldedList,
    0x44 ContractVars,
    0x45 ContractLogs,

    0x50 PeerInfo,
    0x51 PeerInfoSelf,
    0x52 GetExternalAddr,
    0x53 ExternalAddr,

    0x60 BbsMsg,
    0x61 BbsHaveMsg,
    0x62 BbsGetMsg,
    0x63 BbsSubscribe,
    0x64 BbsResetSync,

    0x70 GetBlockFinalization,
    0x71 BlockFinalization,
}
