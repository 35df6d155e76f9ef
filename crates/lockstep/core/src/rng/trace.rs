use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::config::RandTraceConfig;
use crate::state::{ActorId, EntityId, Tick};

/// Which generator method produced a traced value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DrawKind {
    U32,
    U64,
    Range,
    D100,
    Chance,
}

/// One recorded draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RandCall {
    /// Position of the draw among all draws of the generator.
    pub index: u64,
    pub tick: Tick,
    pub actor: Option<ActorId>,
    pub entity: Option<EntityId>,
    pub kind: DrawKind,
    pub value: u64,
}

impl RandCall {
    fn same_draw(&self, other: &RandCall) -> bool {
        self.tick == other.tick
            && self.actor == other.actor
            && self.entity == other.entity
            && self.kind == other.kind
            && self.value == other.value
    }

    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.tick.0.to_le_bytes());
        hasher.update(self.actor.map_or(u32::MAX, |a| a.0).to_le_bytes());
        hasher.update(self.entity.map_or(u32::MAX, |e| e.0).to_le_bytes());
        hasher.update([self.kind as u8]);
        hasher.update(self.value.to_le_bytes());
    }
}

/// First point at which two traces disagree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub index: u64,
    pub ours: Option<RandCall>,
    pub theirs: Option<RandCall>,
}

/// Bounded record of generator draws with a running digest.
#[derive(Clone, Debug)]
pub struct RandTrace {
    config: RandTraceConfig,
    calls: VecDeque<RandCall>,
    next_index: u64,
    recorded: u64,
    hasher: Sha256,
}

impl RandTrace {
    pub fn new(config: RandTraceConfig) -> Self {
        Self {
            calls: VecDeque::with_capacity(config.capacity.min(1024)),
            config,
            next_index: 0,
            recorded: 0,
            hasher: Sha256::new(),
        }
    }

    /// Counts a draw and records it if `tick` is inside the window.
    pub fn record(
        &mut self,
        tick: Tick,
        actor: Option<ActorId>,
        entity: Option<EntityId>,
        kind: DrawKind,
        value: u64,
    ) {
        let index = self.next_index;
        self.next_index += 1;

        if !self.config.records(tick) {
            return;
        }

        let call = RandCall {
            index,
            tick,
            actor,
            entity,
            kind,
            value,
        };
        call.feed(&mut self.hasher);
        self.recorded += 1;

        while self.calls.len() >= self.config.capacity.max(1) {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }

    /// Total number of draws seen, recorded or not.
    pub fn draws(&self) -> u64 {
        self.next_index
    }

    /// Number of draws that went into the digest.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Retained calls, oldest first.
    pub fn calls(&self) -> impl Iterator<Item = &RandCall> {
        self.calls.iter()
    }

    /// SHA-256 over every recorded draw, including ones no longer retained.
    pub fn digest(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }

    /// Returns the first retained call that differs from `other`.
    ///
    /// Comparison starts at the oldest index retained by both traces.
    pub fn first_divergence(&self, other: &RandTrace) -> Option<Divergence> {
        let start = match (self.calls.front(), other.calls.front()) {
            (Some(a), Some(b)) => a.index.max(b.index),
            (None, None) => return None,
            (Some(a), None) => a.index,
            (None, Some(b)) => b.index,
        };

        let mut ours = self.calls.iter().skip_while(|c| c.index < start).copied();
        let mut theirs = other.calls.iter().skip_while(|c| c.index < start).copied();

        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return None,
                (Some(a), Some(b)) if a.index == b.index && a.same_draw(&b) => continue,
                (a, b) => {
                    let index = match (a, b) {
                        (Some(a), Some(b)) => a.index.min(b.index),
                        (Some(a), None) => a.index,
                        (None, Some(b)) => b.index,
                        (None, None) => start,
                    };
                    return Some(Divergence {
                        index,
                        ours: a,
                        theirs: b,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_values(trace: &mut RandTrace, values: &[u64]) {
        for (i, value) in values.iter().enumerate() {
            trace.record(Tick(i as u64), Some(ActorId(1)), None, DrawKind::U32, *value);
        }
    }

    #[test]
    fn identical_traces_have_equal_digests_and_no_divergence() {
        let mut a = RandTrace::new(RandTraceConfig::enabled());
        let mut b = RandTrace::new(RandTraceConfig::enabled());
        record_values(&mut a, &[1, 2, 3]);
        record_values(&mut b, &[1, 2, 3]);

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.first_divergence(&b), None);
    }

    #[test]
    fn first_differing_call_is_reported() {
        let mut a = RandTrace::new(RandTraceConfig::enabled());
        let mut b = RandTrace::new(RandTraceConfig::enabled());
        record_values(&mut a, &[1, 2, 3, 4]);
        record_values(&mut b, &[1, 2, 9, 4]);

        let divergence = a.first_divergence(&b).unwrap();
        assert_eq!(divergence.index, 2);
        assert_eq!(divergence.ours.map(|c| c.value), Some(3));
        assert_eq!(divergence.theirs.map(|c| c.value), Some(9));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn capacity_bounds_retained_calls_but_not_the_digest() {
        let mut small = RandTrace::new(RandTraceConfig::enabled().with_capacity(2));
        let mut large = RandTrace::new(RandTraceConfig::enabled());
        record_values(&mut small, &[5, 6, 7]);
        record_values(&mut large, &[5, 6, 7]);

        assert_eq!(small.calls().count(), 2);
        assert_eq!(small.digest(), large.digest());
        assert_eq!(small.first_divergence(&large), None);
    }

    #[test]
    fn tick_window_filters_recording_but_counts_draws() {
        let config = RandTraceConfig::enabled().with_tick_window(Tick(1), Tick(2));
        let mut trace = RandTrace::new(config);
        record_values(&mut trace, &[1, 2, 3, 4]);

        assert_eq!(trace.draws(), 4);
        assert_eq!(trace.recorded(), 2);
        assert_eq!(
            trace.calls().map(|c| c.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
