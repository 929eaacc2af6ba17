//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use mist_types::Height;

use crate::error::NodeError;

/// Configuration for a mist node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to listen on for P2P connections.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// UDP discovery beacon port; 0 reuses the listen port.
    #[serde(default)]
    pub beacon_port: u16,

    /// Beacon announcement period.
    #[serde(default = "default_beacon_period_ms")]
    pub beacon_period_ms: u64,

    /// Peers to dial on startup.
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    /// Keep connections to the `connect` peers regardless of rating.
    #[serde(default)]
    pub peers_persistent: bool,

    /// How many peers the node tries to keep active.
    #[serde(default = "default_target_peers")]
    pub target_peers: usize,

    /// In-process mining threads; 0 disables local mining.
    #[serde(default)]
    pub mining_threads: usize,

    /// Verification worker threads. 0 runs validation on the reactor;
    /// negative means cores minus `mining_threads`.
    #[serde(default)]
    pub verification_threads: i32,

    #[serde(default = "default_max_concurrent_blocks")]
    pub max_concurrent_blocks_request: u32,

    #[serde(default = "default_pool_cap")]
    pub max_pool_transactions: usize,

    #[serde(default = "default_pool_cap")]
    pub max_deferred_transactions: usize,

    /// Log chain events (may be sensitive; off by default).
    #[serde(default)]
    pub log_events: bool,

    #[serde(default = "default_true")]
    pub log_tx_stem: bool,

    #[serde(default = "default_true")]
    pub log_tx_fluff: bool,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[serde(default)]
    pub rollback_limit: RollbackLimitConfig,

    #[serde(default)]
    pub bbs: BbsSection,

    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    #[serde(default)]
    pub dandelion: DandelionConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub test_mode: TestModeConfig,
}

/// Request/response timeouts, milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_get_state_ms")]
    pub get_state_ms: u64,
    #[serde(default = "default_get_block_ms")]
    pub get_block_ms: u64,
    #[serde(default = "default_get_tx_ms")]
    pub get_tx_ms: u64,
    #[serde(default = "default_get_bbs_msg_ms")]
    pub get_bbs_msg_ms: u64,
    #[serde(default = "default_mining_soft_restart_ms")]
    pub mining_soft_restart_ms: u64,
    #[serde(default = "default_peers_update_ms")]
    pub peers_update_ms: u64,
    #[serde(default = "default_peers_db_flush_ms")]
    pub peers_db_flush_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollbackLimitConfig {
    /// Ceiling on silent automatic rollback.
    #[serde(default = "default_rollback_max")]
    pub max: Height,
    /// Tip age after which deeper rollback becomes permissible, seconds.
    #[serde(default = "default_timeout_since_tip_s")]
    pub timeout_since_tip_s: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BbsSection {
    #[serde(default = "default_bbs_timeout_s")]
    pub message_timeout_s: u64,
    #[serde(default = "default_bbs_limit_count")]
    pub limit_count: u64,
    #[serde(default = "default_bbs_limit_size")]
    pub limit_size: u64,
    #[serde(default = "default_bbs_cleanup_ms")]
    pub cleanup_period_ms: u64,
    #[serde(default = "default_bbs_pow_bits")]
    pub pow_difficulty: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Pending-send bytes past which non-essential sends stall.
    #[serde(default = "default_choking")]
    pub choking: usize,
    /// Pending-send bytes past which the peer is disconnected.
    #[serde(default = "default_drown")]
    pub drown: usize,
    #[serde(default = "default_max_body_pack_size")]
    pub max_body_pack_size: usize,
    #[serde(default = "default_max_body_pack_count")]
    pub max_body_pack_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DandelionConfig {
    /// Fluff-on-receipt probability, normalized to 16 bits (0x1999 ≈ 10%).
    #[serde(default = "default_fluff_probability")]
    pub fluff_probability: u16,
    #[serde(default = "default_stem_timeout_min_ms")]
    pub timeout_min_ms: u64,
    #[serde(default = "default_stem_timeout_max_ms")]
    pub timeout_max_ms: u64,
    /// Stem transactions not mined within this many blocks are fluffed.
    #[serde(default = "default_dh_stem_confirm")]
    pub dh_stem_confirm: Height,
    #[serde(default = "default_aggregation_time_ms")]
    pub aggregation_time_ms: u64,
    /// Aggregates below this input+output count get dummy padding.
    #[serde(default = "default_outputs_min")]
    pub outputs_min: usize,
    #[serde(default = "default_outputs_max")]
    pub outputs_max: usize,
    #[serde(default = "default_dummy_lifetime_lo")]
    pub dummy_lifetime_lo: Height,
    /// 0 disables dummy creation.
    #[serde(default = "default_dummy_lifetime_hi")]
    pub dummy_lifetime_hi: Height,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Output directory for recovery snapshots; empty disables emission.
    #[serde(default)]
    pub path: PathBuf,
    /// Block interval between recovery generations.
    #[serde(default = "default_recovery_granularity")]
    pub granularity: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestModeConfig {
    /// Produce blocks at a fixed cadence without real work. 0 disables.
    #[serde(default)]
    pub fake_pow_solve_time_ms: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen() -> SocketAddr {
    "0.0.0.0:31744".parse().expect("static addr")
}

fn default_beacon_period_ms() -> u64 {
    500
}

fn default_target_peers() -> usize {
    16
}

fn default_max_concurrent_blocks() -> u32 {
    18
}

fn default_pool_cap() -> usize {
    100_000
}

fn default_true() -> bool {
    true
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_get_state_ms() -> u64 {
    5_000
}

fn default_get_block_ms() -> u64 {
    30_000
}

fn default_get_tx_ms() -> u64 {
    5_000
}

fn default_get_bbs_msg_ms() -> u64 {
    10_000
}

fn default_mining_soft_restart_ms() -> u64 {
    1_000
}

fn default_peers_update_ms() -> u64 {
    1_000
}

fn default_peers_db_flush_ms() -> u64 {
    60_000
}

fn default_rollback_max() -> Height {
    60
}

fn default_timeout_since_tip_s() -> u64 {
    3_600
}

fn default_bbs_timeout_s() -> u64 {
    43_200
}

fn default_bbs_limit_count() -> u64 {
    20_000_000
}

fn default_bbs_limit_size() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_bbs_cleanup_ms() -> u64 {
    3_600_000
}

fn default_bbs_pow_bits() -> u32 {
    8
}

fn default_choking() -> usize {
    1024 * 1024
}

fn default_drown() -> usize {
    20 * 1024 * 1024
}

fn default_max_body_pack_size() -> usize {
    5 * 1024 * 1024
}

fn default_max_body_pack_count() -> u32 {
    3_000
}

fn default_fluff_probability() -> u16 {
    0x1999
}

fn default_stem_timeout_min_ms() -> u64 {
    20_000
}

fn default_stem_timeout_max_ms() -> u64 {
    50_000
}

fn default_dh_stem_confirm() -> Height {
    5
}

fn default_aggregation_time_ms() -> u64 {
    10_000
}

fn default_outputs_min() -> usize {
    5
}

fn default_outputs_max() -> usize {
    40
}

fn default_dummy_lifetime_lo() -> Height {
    720
}

fn default_dummy_lifetime_hi() -> Height {
    10_080
}

fn default_recovery_granularity() -> u32 {
    30
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("NodeConfig is always serializable to TOML")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_toml_str("").expect("empty config uses defaults")
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            get_state_ms: default_get_state_ms(),
            get_block_ms: default_get_block_ms(),
            get_tx_ms: default_get_tx_ms(),
            get_bbs_msg_ms: default_get_bbs_msg_ms(),
            mining_soft_restart_ms: default_mining_soft_restart_ms(),
            peers_update_ms: default_peers_update_ms(),
            peers_db_flush_ms: default_peers_db_flush_ms(),
        }
    }
}

impl Default for RollbackLimitConfig {
    fn default() -> Self {
        Self {
            max: default_rollback_max(),
            timeout_since_tip_s: default_timeout_since_tip_s(),
        }
    }
}

impl Default for BbsSection {
    fn default() -> Self {
        Self {
            message_timeout_s: default_bbs_timeout_s(),
            limit_count: default_bbs_limit_count(),
            limit_size: default_bbs_limit_size(),
            cleanup_period_ms: default_bbs_cleanup_ms(),
            pow_difficulty: default_bbs_pow_bits(),
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            choking: default_choking(),
            drown: default_drown(),
            max_body_pack_size: default_max_body_pack_size(),
            max_body_pack_count: default_max_body_pack_count(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            granularity: default_recovery_granularity(),
        }
    }
}

impl Default for DandelionConfig {
    fn default() -> Self {
        Self {
            fluff_probability: default_fluff_probability(),
            timeout_min_ms: default_stem_timeout_min_ms(),
            timeout_max_ms: default_stem_timeout_max_ms(),
            dh_stem_confirm: default_dh_stem_confirm(),
            aggregation_time_ms: default_aggregation_time_ms(),
            outputs_min: default_outputs_min(),
            outputs_max: default_outputs_max(),
            dummy_lifetime_lo: default_dummy_lifetime_lo(),
            dummy_lifetime_hi: default_dummy_lifetime_hi(),
        }
    }
}
