// src/core/bundle.rs

//! The bundle hash ring: deterministic placement of topics into contiguous
//! 32-bit hash ranges.
//!
//! Every topic hashes to a point on a `[0, 2^32)` ring; a namespace carves
//! the ring into bundles, each a contiguous range owned by at most one
//! broker. The hash function is fixed as CRC-32/ISO-HDLC over the canonical
//! `<property>/<cluster>/<namespace>/<local>` path and is part of the wire
//! compatibility contract: changing it remaps every topic.

use crate::core::DriftError;
use crate::core::topic::TopicName;
use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The inclusive upper boundary of the hash ring.
pub const FULL_RANGE_END: u32 = u32::MAX;

const CRC32_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Calculates the ring position of a topic.
pub fn hash_of(topic: &TopicName) -> u32 {
    CRC32_ALGO.checksum(topic.path().as_bytes())
}

/// Hashes a message partition key with the same fixed algorithm, used by
/// the partitioned-producer router.
pub fn hash_of_key(key: &str) -> u32 {
    CRC32_ALGO.checksum(key.as_bytes())
}

/// One bundle: the range `[lo, hi)`, except that the topmost bundle
/// (`hi == 0xffffffff`) also contains the maximum hash value so the ring is
/// fully covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleRange {
    pub lo: u32,
    pub hi: u32,
}

impl BundleRange {
    pub fn new(lo: u32, hi: u32) -> Self {
        Self { lo, hi }
    }

    /// The full ring as a single bundle.
    pub fn full() -> Self {
        Self {
            lo: 0,
            hi: FULL_RANGE_END,
        }
    }

    pub fn contains(&self, hash: u32) -> bool {
        if hash < self.lo {
            return false;
        }
        hash < self.hi || (self.hi == FULL_RANGE_END && hash == FULL_RANGE_END)
    }

    /// The midpoint of the range, used as the default split point.
    pub fn midpoint(&self) -> u32 {
        let hi = self.exclusive_hi();
        (u64::from(self.lo) + (hi - u64::from(self.lo)) / 2) as u32
    }

    fn exclusive_hi(&self) -> u64 {
        if self.hi == FULL_RANGE_END {
            1u64 << 32
        } else {
            u64::from(self.hi)
        }
    }
}

impl fmt::Display for BundleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}_0x{:08x}", self.lo, self.hi)
    }
}

impl FromStr for BundleRange {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once('_')
            .ok_or_else(|| DriftError::InvalidBundles(format!("malformed bundle id '{s}'")))?;
        Ok(Self {
            lo: parse_boundary(lo)?,
            hi: parse_boundary(hi)?,
        })
    }
}

fn parse_boundary(s: &str) -> Result<u32, DriftError> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| DriftError::InvalidBundles(format!("boundary '{s}' missing 0x prefix")))?;
    u32::from_str_radix(digits, 16)
        .map_err(|_| DriftError::InvalidBundles(format!("boundary '{s}' is not 32-bit hex")))
}

/// The bundles descriptor of a namespace: a strictly increasing boundary
/// list starting at `0` and ending at `0xffffffff`. The `N` bundles are
/// `[b_i, b_{i+1})` for consecutive boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlesDescriptor {
    pub boundaries: Vec<u32>,
}

impl BundlesDescriptor {
    /// Builds the default even partition of the ring into `count` bundles.
    pub fn with_default_bundles(count: u32) -> Result<Self, DriftError> {
        if count == 0 {
            return Err(DriftError::InvalidBundles(
                "bundle count must be at least 1".to_string(),
            ));
        }
        let segment = (1u64 << 32) / u64::from(count);
        let mut boundaries: Vec<u32> = (0..count).map(|i| (u64::from(i) * segment) as u32).collect();
        boundaries.push(FULL_RANGE_END);
        Ok(Self { boundaries })
    }

    /// Validates externally supplied hex boundaries: parsed, sorted with
    /// duplicates dropped, then required to start at `0`, end at
    /// `0xffffffff`, and be strictly increasing.
    pub fn from_hex_boundaries(raw: &[String]) -> Result<Self, DriftError> {
        let mut boundaries = raw
            .iter()
            .map(|s| {
                let trimmed = s.strip_prefix("0x").unwrap_or(s);
                u32::from_str_radix(trimmed, 16).map_err(|_| {
                    DriftError::InvalidBundles(format!("boundary '{s}' is not 32-bit hex"))
                })
            })
            .collect::<Result<Vec<u32>, _>>()?;
        boundaries.sort_unstable();
        boundaries.dedup();
        Self::from_boundaries(boundaries)
    }

    /// Validates an already numeric boundary list.
    pub fn from_boundaries(boundaries: Vec<u32>) -> Result<Self, DriftError> {
        if boundaries.len() < 2 {
            return Err(DriftError::InvalidBundles(
                "at least two boundaries are required".to_string(),
            ));
        }
        if boundaries[0] != 0 {
            return Err(DriftError::InvalidBundles(
                "first boundary must be 0x00000000".to_string(),
            ));
        }
        if *boundaries.last().unwrap() != FULL_RANGE_END {
            return Err(DriftError::InvalidBundles(
                "last boundary must be 0xffffffff".to_string(),
            ));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DriftError::InvalidBundles(
                "boundaries must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { boundaries })
    }

    pub fn bundle_count(&self) -> usize {
        self.boundaries.len() - 1
    }

    /// All bundles, in ring order.
    pub fn bundles(&self) -> Vec<BundleRange> {
        self.boundaries
            .windows(2)
            .map(|w| BundleRange::new(w[0], w[1]))
            .collect()
    }

    /// Locates the unique bundle containing a ring position via binary
    /// search over the boundary list.
    pub fn find_bundle(&self, hash: u32) -> BundleRange {
        let idx = match self.boundaries.binary_search(&hash) {
            // An exact boundary hit starts that bundle, except for the final
            // boundary which belongs to the topmost bundle.
            Ok(i) => i.min(self.bundle_count() - 1),
            Err(i) => i - 1,
        };
        BundleRange::new(self.boundaries[idx], self.boundaries[idx + 1])
    }

    /// The bundle a topic currently routes to.
    pub fn bundle_for(&self, topic: &TopicName) -> BundleRange {
        self.find_bundle(hash_of(topic))
    }

    /// Whether `range` is one of the descriptor's current bundles.
    pub fn contains_bundle(&self, range: &BundleRange) -> bool {
        match self.boundaries.binary_search(&range.lo) {
            Ok(i) => i + 1 < self.boundaries.len() && self.boundaries[i + 1] == range.hi,
            Err(_) => false,
        }
    }

    /// Returns a new descriptor in which `range` is split at `point`,
    /// leaving all other bundles untouched.
    pub fn split(&self, range: &BundleRange, point: u32) -> Result<BundlesDescriptor, DriftError> {
        if !self.contains_bundle(range) {
            return Err(DriftError::NotFound(format!(
                "bundle {range} is not part of the current descriptor"
            )));
        }
        if point <= range.lo || point >= range.hi {
            return Err(DriftError::InvalidBundles(format!(
                "split point 0x{point:08x} is outside bundle {range}"
            )));
        }
        let mut boundaries = self.boundaries.clone();
        let insert_at = boundaries.binary_search(&point).err().ok_or_else(|| {
            DriftError::InvalidBundles(format!("split point 0x{point:08x} already a boundary"))
        })?;
        boundaries.insert(insert_at, point);
        Self::from_boundaries(boundaries)
    }
}
