//! The `ChainProcessor` collaborator interface.
//!
//! The processor owns header/body verification, the state DAG, fast-sync,
//! and the database. The node drives it with peer-delivered data and reacts
//! to the events it emits.

use mist_types::{BlockId, CoinId, Height, KernelId, NodeId, SystemState};

use crate::error::ChainError;

/// Verdict on a piece of chain data offered by a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// New and valid; the DAG advanced.
    Accepted,
    /// Already known: harmless, but not useful.
    Rejected,
    /// Failed validation: the peer served bad data.
    Invalid,
    /// Valid in isolation but unconnected to any known state.
    Unreachable,
}

/// A piece of chain data the processor wants fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRequest {
    pub id: BlockId,
    pub is_body: bool,
    /// The sync cursor this request is working toward.
    pub target: BlockId,
}

/// Events the processor reports back while digesting data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessorEvent {
    /// The tip changed.
    NewState,
    /// The chain rolled back below the given id.
    RolledBack(BlockId),
    /// Persistent state was modified (a DB flush should be scheduled).
    Modified,
    /// Fast-sync finished; full validation mode is available.
    FastSyncSucceeded,
    /// The named peer served provably insane data and must go.
    PeerInsane(NodeId),
    /// Fetch this id from peers.
    RequestData(DataRequest),
}

/// Proof queries the node routes from peers to the processor. The proof
/// encoding is opaque here; `None` means the query cannot be served and
/// the peer receives `DataMissing`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProofQuery {
    State(Height),
    Kernel(KernelId),
    Kernel2 { id: KernelId, fetch: bool },
    Utxo(CoinId),
    ShieldedOutp(u64),
    ShieldedInp(u64),
    Asset(u32),
    ChainWork,
    ShieldedOutputsAt(Height),
    ShieldedList { from: u64, count: u32 },
    Events { height_min: Height },
    ContractVar(Vec<u8>),
    ContractVars { key_min: Vec<u8>, key_max: Vec<u8> },
    ContractLogs { height_min: Height, height_max: Height },
    ContractLogProof { height: Height, idx: u32 },
}

pub trait ChainProcessor: Send {
    /// Current tip, if past genesis.
    fn tip(&self) -> Option<SystemState>;

    /// The consensus-rule bound on rollback depth.
    fn rules_max_rollback(&self) -> Height;

    /// Whether the processor is still in fast-sync (narrowed validation).
    fn is_fast_sync(&self) -> bool;

    /// Fast-sync horizons `(height_hard_lo, height_txo_lo)` to stamp onto
    /// body requests at assignment time.
    fn fast_sync_horizons(&self) -> (Height, Height);

    /// Digest a header pack (ascending height, internally chained).
    fn on_header_pack(
        &mut self,
        states: &[SystemState],
        from: NodeId,
    ) -> (DataStatus, Vec<ProcessorEvent>);

    /// Digest a block body.
    fn on_body(
        &mut self,
        id: &BlockId,
        perishable: &[u8],
        eternal: &[u8],
        from: NodeId,
    ) -> (DataStatus, Vec<ProcessorEvent>);

    /// Try to advance the tip along the best known branch, rolling back at
    /// most `max_rollback` states to switch branches.
    fn try_go_up(&mut self, max_rollback: Height) -> Vec<ProcessorEvent>;

    /// Enumerate data the processor is still missing (congestions).
    fn enum_congestions(&mut self) -> Vec<DataRequest>;

    /// Persist pending state.
    fn flush(&mut self) -> Result<(), ChainError>;

    // -- Serving peers ----------------------------------------------------

    fn get_header(&self, id: &BlockId) -> Option<SystemState>;

    /// Up to `count` headers ending at `top`, ascending, strictly chained.
    fn get_header_pack(&self, top: &BlockId, count: u32) -> Vec<SystemState>;

    fn get_body(&self, id: &BlockId) -> Option<(Vec<u8>, Vec<u8>)>;

    fn get_proof(&self, query: &ProofQuery) -> Option<Vec<u8>>;
}
