//! Repository contracts for per-tick replica digests.

use std::collections::BTreeMap;

use lockstep_core::Tick;
use serde::{Deserialize, Serialize};

use super::Result;
use crate::workers::{ReplicaId, TickReport};

/// Digest one replica reported for one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub tick: Tick,
    pub replica: ReplicaId,
    pub digest: [u8; 32],
    pub rand_digest: Option<[u8; 32]>,
}

impl From<&TickReport> for DigestRecord {
    fn from(report: &TickReport) -> Self {
        Self {
            tick: report.tick,
            replica: report.replica,
            digest: report.digest,
            rand_digest: report.rand_digest,
        }
    }
}

/// Append-only store of [`DigestRecord`]s.
///
/// Kept so two runs of the same world can be compared after the fact.
pub trait DigestRepository: Send {
    fn append(&mut self, record: &DigestRecord) -> Result<()>;

    /// Every record, in append order.
    fn load_all(&self) -> Result<Vec<DigestRecord>>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Earliest tick at which the recorded replicas disagree.
pub fn first_divergent_tick(records: &[DigestRecord]) -> Option<Tick> {
    let mut by_tick: BTreeMap<Tick, [u8; 32]> = BTreeMap::new();
    let mut divergent: Option<Tick> = None;
    for record in records {
        match by_tick.get(&record.tick) {
            Some(digest) if *digest != record.digest => {
                divergent = Some(divergent.map_or(record.tick, |tick| tick.min(record.tick)));
            }
            Some(_) => {}
            None => {
                by_tick.insert(record.tick, record.digest);
            }
        }
    }
    divergent
}
