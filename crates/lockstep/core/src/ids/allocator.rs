use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::LockstepConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::gate::ExecutionPhase;

use super::{AllocError, IdRange, OverflowRequest, OwnerKey};

/// Receives overflow requests; sending must not block.
pub trait OverflowSink {
    fn request(&self, request: OverflowRequest);
}

impl<F> OverflowSink for F
where
    F: Fn(OverflowRequest),
{
    fn request(&self, request: OverflowRequest) {
        self(request)
    }
}

/// Active block of one owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdBlock {
    pub owner: OwnerKey,
    pub range: IdRange,
    /// Next id to hand out.
    pub current: u32,
    pub overflow_requested: bool,
}

impl IdBlock {
    fn fresh(owner: OwnerKey, range: IdRange) -> Self {
        Self {
            owner,
            range,
            current: range.start,
            overflow_requested: false,
        }
    }

    /// Number of ids handed out so far.
    pub const fn used(&self) -> u32 {
        self.current - self.range.start
    }

    pub const fn remaining(&self) -> u32 {
        self.range.size - self.used()
    }

    pub const fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn crossed_threshold(&self, percent: u32) -> bool {
        u64::from(self.used()) * 100 >= u64::from(self.range.size) * u64::from(percent)
    }
}

/// Outcome of [`IdAllocator::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdAssignment {
    Assigned(u32),
    /// Interactive code must not consume ids; the id is assigned when the
    /// command replays on every replica.
    Deferred,
}

impl IdAssignment {
    pub const fn id(&self) -> Option<u32> {
        match self {
            Self::Assigned(id) => Some(*id),
            Self::Deferred => None,
        }
    }
}

/// Per-owner id blocks of one replica.
pub struct IdAllocator {
    blocks: RefCell<BTreeMap<OwnerKey, IdBlock>>,
    overflow_sink: Box<dyn OverflowSink>,
    threshold_percent: u32,
    diagnostics: Diagnostics,
}

impl IdAllocator {
    pub fn new(overflow_sink: impl OverflowSink + 'static, diagnostics: Diagnostics) -> Self {
        Self {
            blocks: RefCell::new(BTreeMap::new()),
            overflow_sink: Box::new(overflow_sink),
            threshold_percent: LockstepConfig::DEFAULT_OVERFLOW_THRESHOLD_PERCENT,
            diagnostics,
        }
    }

    #[must_use]
    pub fn with_threshold_percent(mut self, percent: u32) -> Self {
        self.threshold_percent = percent.clamp(1, 100);
        self
    }

    pub fn threshold_percent(&self) -> u32 {
        self.threshold_percent
    }

    /// Installs `range` as the active block of `owner`.
    ///
    /// Installing the range that is already active keeps its progress. A
    /// different range replaces the active block; when the old block had not
    /// asked for a replacement this is reported as `BlockReassigned`.
    pub fn install_block(&self, owner: OwnerKey, range: IdRange) -> Result<(), AllocError> {
        if !range.is_valid() {
            return Err(AllocError::InvalidBlock {
                owner,
                start: range.start,
                size: range.size,
            });
        }

        let previous = self
            .blocks
            .borrow_mut()
            .insert(owner, IdBlock::fresh(owner, range));

        match previous {
            Some(existing) if existing.range == range => {
                self.blocks.borrow_mut().insert(owner, existing);
                tracing::debug!(
                    target: "lockstep::ids",
                    %owner,
                    start = range.start,
                    "ignoring re-install of active id block"
                );
            }
            Some(existing) if !existing.overflow_requested => {
                self.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::BlockReassigned,
                    format!(
                        "reassigning active id block for {owner}: \
                         [{}, +{}) at {} replaced by [{}, +{})",
                        existing.range.start,
                        existing.range.size,
                        existing.current,
                        range.start,
                        range.size
                    ),
                ));
            }
            _ => {
                tracing::debug!(
                    target: "lockstep::ids",
                    %owner,
                    start = range.start,
                    size = range.size,
                    "installed id block"
                );
            }
        }

        Ok(())
    }

    /// Hands out the next id of `owner`'s block.
    pub fn next_id(&self, owner: OwnerKey) -> Result<u32, AllocError> {
        let (id, request) = {
            let mut blocks = self.blocks.borrow_mut();
            let Some(block) = blocks.get_mut(&owner) else {
                drop(blocks);
                self.diagnostics.report(Diagnostic::new(
                    DiagnosticKind::NoIdBlock,
                    format!("id requested for {owner} with no installed block"),
                ));
                return Err(AllocError::NoBlock { owner });
            };

            if block.is_exhausted() {
                let (start, size) = (block.range.start, block.range.size);
                drop(blocks);
                self.diagnostics.report_once(
                    exhaustion_key(owner, start),
                    Diagnostic::new(
                        DiagnosticKind::IdBlockExhausted,
                        format!(
                            "id block [{start}, +{size}) for {owner} exhausted \
                             before a replacement arrived"
                        ),
                    ),
                );
                return Err(AllocError::Exhausted { owner, start, size });
            }

            let id = block.current;
            block.current += 1;

            let request = if !block.overflow_requested
                && block.crossed_threshold(self.threshold_percent)
            {
                block.overflow_requested = true;
                Some(OverflowRequest {
                    owner,
                    exhausted_start: block.range.start,
                    exhausted_size: block.range.size,
                })
            } else {
                None
            };

            (id, request)
        };

        if let Some(request) = request {
            tracing::info!(
                target: "lockstep::ids",
                %owner,
                start = request.exhausted_start,
                size = request.exhausted_size,
                "id block nearly used up; requesting replacement"
            );
            self.overflow_sink.request(request);
        }

        Ok(id)
    }

    /// Assigns an id only in replicated phases.
    pub fn allocate(
        &self,
        owner: OwnerKey,
        phase: ExecutionPhase,
    ) -> Result<IdAssignment, AllocError> {
        if phase.is_replicated() {
            self.next_id(owner).map(IdAssignment::Assigned)
        } else {
            Ok(IdAssignment::Deferred)
        }
    }

    pub fn block(&self, owner: OwnerKey) -> Option<IdBlock> {
        self.blocks.borrow().get(&owner).copied()
    }

    /// Every active block, ordered by owner.
    pub fn blocks(&self) -> Vec<IdBlock> {
        self.blocks.borrow().values().copied().collect()
    }
}

impl fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAllocator")
            .field("blocks", &self.blocks.borrow())
            .field("threshold_percent", &self.threshold_percent)
            .finish()
    }
}

fn exhaustion_key(owner: OwnerKey, start: u32) -> u64 {
    let owner_bits = match owner {
        OwnerKey::Global => 0,
        OwnerKey::Location(location) => u64::from(location.0) + 1,
    };
    (owner_bits << 32) | u64::from(start)
}
