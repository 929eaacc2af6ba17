//! The confidential-transaction model the mempool works with.
//!
//! Inputs spend opaque coin commitments, outputs create them, and kernels
//! carry the fee and validity height range. Cryptographic verification of
//! commitments and kernel signatures happens in the validation collaborator;
//! the node only needs the structural view.

use serde::{Deserialize, Serialize};

use crate::hash::{CoinId, KernelId};
use crate::state::{Height, MAX_HEIGHT};

/// Serialized-size proxy weights per transaction element. Outputs dominate
/// (range proofs), kernels carry signatures, inputs are bare references.
const WEIGHT_INPUT: usize = 1;
const WEIGHT_OUTPUT: usize = 4;
const WEIGHT_KERNEL: usize = 3;

/// An inclusive height range a transaction is valid within.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl HeightRange {
    pub const FULL: Self = Self {
        min: 0,
        max: MAX_HEIGHT,
    };

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, h: Height) -> bool {
        h >= self.min && h <= self.max
    }

    pub fn intersect(&self, other: &HeightRange) -> HeightRange {
        HeightRange {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }
}

impl Default for HeightRange {
    fn default() -> Self {
        Self::FULL
    }
}

/// A transaction input: a reference to the coin commitment it spends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub spends: CoinId,
}

/// A transaction output: a fresh coin commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub commitment: CoinId,
}

/// A transaction kernel: the fee-bearing, signed element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxKernel {
    pub id: KernelId,
    pub fee: u64,
    pub height_min: Height,
    pub height_max: Height,
}

impl TxKernel {
    pub fn height_range(&self) -> HeightRange {
        HeightRange {
            min: self.height_min,
            max: self.height_max,
        }
    }
}

/// A complete transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub kernels: Vec<TxKernel>,
}

impl Transaction {
    /// Mempool key: the lowest kernel id. Stable across re-serialization,
    /// and distinct for any two transactions that do not share a kernel.
    pub fn key(&self) -> KernelId {
        self.kernels
            .iter()
            .map(|k| k.id)
            .min()
            .unwrap_or(KernelId::ZERO)
    }

    /// Total fee across all kernels.
    pub fn fee(&self) -> u64 {
        self.kernels.iter().map(|k| k.fee).sum()
    }

    /// Serialized-size proxy used for fee-density ordering and size caps.
    pub fn weight(&self) -> usize {
        self.inputs.len() * WEIGHT_INPUT
            + self.outputs.len() * WEIGHT_OUTPUT
            + self.kernels.len() * WEIGHT_KERNEL
    }

    /// Combined input + output count: the Dandelion aggregation metric.
    pub fn io_count(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    /// Intersection of all kernel validity ranges.
    pub fn height_range(&self) -> HeightRange {
        self.kernels
            .iter()
            .fold(HeightRange::FULL, |acc, k| acc.intersect(&k.height_range()))
    }

    /// Fee per unit weight, scaled to keep integer precision.
    pub fn fee_density(&self) -> u64 {
        let w = self.weight().max(1) as u64;
        self.fee().saturating_mul(1000) / w
    }
}
