//! Chain-ID Quorum Validator
//!
//! Healthy records are grouped by the chain they were expected to serve. In
//! each group the chain id reported by the most endpoints is taken as the
//! real one, and endpoints reporting anything else are excluded.
//!
//! The rule is deliberately not a strict majority: the expected id starts as
//! dominant with a count of zero, and another id replaces it only with a
//! strictly greater count. On an exact tie the expected id wins.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::types::{HealthyRecord, ProbeError};

/// Outcome of quorum resolution over all groups
#[derive(Debug, Default)]
pub struct QuorumResult {
    /// Records agreeing with their group's dominant id, per expected chain
    pub validated: BTreeMap<String, Vec<HealthyRecord>>,

    /// Distinct excluded ids per expected chain, in first-seen order
    pub mismatches: BTreeMap<String, Vec<String>>,

    /// Every excluded record with the id it lost to
    pub excluded: Vec<(HealthyRecord, String)>,
}

impl QuorumResult {
    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }
}

/// Returned ids with their counts, in first-seen order
struct IdTally {
    counts: Vec<(String, usize)>,
}

impl IdTally {
    fn new(expected: &str) -> Self {
        Self {
            counts: vec![(expected.to_string(), 0)],
        }
    }

    fn add(&mut self, id: &str) {
        match self.counts.iter_mut().find(|(seen, _)| seen == id) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((id.to_string(), 1)),
        }
    }

    /// First id whose count is strictly greater than every id before it
    fn dominant(&self) -> &str {
        let mut best = &self.counts[0];
        for entry in &self.counts[1..] {
            if entry.1 > best.1 {
                best = entry;
            }
        }
        &best.0
    }
}

/// Resolve the dominant chain id of every group and partition its records
pub fn validate_chain_ids(records: Vec<HealthyRecord>) -> QuorumResult {
    let mut groups: BTreeMap<String, Vec<HealthyRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.chain_id.clone()).or_default().push(record);
    }

    let mut result = QuorumResult::default();

    for (expected, group) in groups {
        let mut tally = IdTally::new(&expected);
        for record in &group {
            tally.add(&record.returned_chain_id);
        }
        let dominant = tally.dominant().to_string();

        if dominant != expected {
            warn!(
                "Chain {}: endpoints mostly report chain {} instead",
                expected, dominant
            );
        }

        let mut kept = Vec::with_capacity(group.len());
        let mut mismatched_ids: Vec<String> = Vec::new();

        for record in group {
            if record.returned_chain_id == dominant {
                kept.push(record);
                continue;
            }

            debug!(
                "Chain {}: {} reports {}, dominant is {}",
                expected, record.url, record.returned_chain_id, dominant
            );
            if !mismatched_ids.contains(&record.returned_chain_id) {
                mismatched_ids.push(record.returned_chain_id.clone());
            }
            result.excluded.push((record, dominant.clone()));
        }

        if !mismatched_ids.is_empty() {
            result.mismatches.insert(expected.clone(), mismatched_ids);
        }
        if !kept.is_empty() {
            result.validated.insert(expected, kept);
        }
    }

    result
}

/// Error describing why a record was excluded
pub fn mismatch_error(record: &HealthyRecord, dominant: &str) -> ProbeError {
    ProbeError::ChainIdMismatch {
        expected: record.chain_id.clone(),
        dominant: dominant.to_string(),
        returned: record.returned_chain_id.clone(),
    }
}
