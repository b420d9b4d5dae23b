//! Configuration - Tunable Policy
//!
//! The delta threshold and prefix matching policy are tunables, not laws.
//! Every field has a default so partial JSON files load cleanly.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default)]
    pub store: StorePolicy,
    #[serde(default)]
    pub validation: ValidationLimits,
    #[serde(default)]
    pub vkt: VktOptions,
}

impl CoreConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// When the block store delta-encodes a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorePolicy {
    /// A delta is kept only if smaller than this fraction of the raw payload.
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: f64,
    /// Bases larger or smaller than the candidate by more than this factor are skipped.
    #[serde(default = "default_max_size_ratio")]
    pub max_size_ratio: f64,
    /// Delta hops allowed when reconstructing a payload.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u8,
    /// Minimum shared leading segments for a block to be a delta base.
    #[serde(default = "default_min_shared_segments")]
    pub min_shared_segments: usize,
}

fn default_delta_threshold() -> f64 { 0.6 }
fn default_max_size_ratio() -> f64 { 4.0 }
fn default_max_chain_depth() -> u8 { 1 }
fn default_min_shared_segments() -> usize { 1 }

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            delta_threshold: default_delta_threshold(),
            max_size_ratio: default_max_size_ratio(),
            max_chain_depth: default_max_chain_depth(),
            min_shared_segments: default_min_shared_segments(),
        }
    }
}

impl StorePolicy {
    /// Whether a base of `base_len` bytes is a plausible delta source for
    /// a payload of `payload_len` bytes.
    pub fn size_compatible(&self, base_len: usize, payload_len: usize) -> bool {
        let (small, large) = if base_len < payload_len {
            (base_len, payload_len)
        } else {
            (payload_len, base_len)
        };
        if small == 0 {
            return large == 0;
        }
        large as f64 / small as f64 <= self.max_size_ratio
    }

    pub fn delta_worthwhile(&self, delta_len: usize, payload_len: usize) -> bool {
        (delta_len as f64) < self.delta_threshold * payload_len as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationLimits {
    #[serde(default = "default_max_tail_segments")]
    pub max_tail_segments: usize,
    #[serde(default = "default_max_segment_len")]
    pub max_segment_len: usize,
    #[serde(default = "default_max_coordinate_len")]
    pub max_coordinate_len: usize,
}

fn default_max_tail_segments() -> usize { 8 }
fn default_max_segment_len() -> usize { 64 }
fn default_max_coordinate_len() -> usize { 256 }

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_tail_segments: default_max_tail_segments(),
            max_segment_len: default_max_segment_len(),
            max_coordinate_len: default_max_coordinate_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VktOptions {
    /// zstd level for block frames.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_compression_level() -> i32 { 3 }

impl Default for VktOptions {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
        }
    }
}
