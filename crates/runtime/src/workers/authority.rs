//! Id authority that reserves blocks for every owner.
//!
//! Replicas report overflow requests as they cross the threshold. The
//! coordinator collects the resulting grants at tick boundaries so every
//! replica installs the same blocks at the same tick.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use lockstep_core::{IdRange, OverflowRequest, OwnerKey, Tick};

use super::ReplicaId;
use crate::events::{Event, EventBus, IdEvent};

/// Replacement block reserved for an owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGrant {
    pub owner: OwnerKey,
    pub range: IdRange,
    /// Start of the block this grant replaces.
    pub replaces: Option<u32>,
    /// Tick at whose start replicas install the block.
    pub effective: Tick,
}

/// Messages accepted by the [`IdAuthority`].
pub enum AuthorityCommand {
    /// Reserve a fresh block for `owner`. `None` once the id space is spent.
    Reserve {
        owner: OwnerKey,
        reply: oneshot::Sender<Option<IdRange>>,
    },
    /// A replica's block crossed its threshold.
    Overflow {
        replica: ReplicaId,
        request: OverflowRequest,
    },
    /// Grant every pending request, effective at `effective`.
    Collect {
        effective: Tick,
        reply: oneshot::Sender<Vec<BlockGrant>>,
    },
}

/// Background task handing out disjoint id ranges.
pub struct IdAuthority {
    command_rx: mpsc::UnboundedReceiver<AuthorityCommand>,
    event_bus: EventBus,
    block_size: u32,
    next_start: u32,
    /// Keyed by `(owner, exhausted_start)`; every replica sends the same one.
    pending: BTreeMap<(OwnerKey, u32), OverflowRequest>,
    granted: BTreeMap<(OwnerKey, u32), BlockGrant>,
}

impl IdAuthority {
    pub fn new(
        command_rx: mpsc::UnboundedReceiver<AuthorityCommand>,
        event_bus: EventBus,
        first_id: u32,
        block_size: u32,
    ) -> Self {
        Self {
            command_rx,
            event_bus,
            block_size: block_size.max(1),
            next_start: first_id,
            pending: BTreeMap::new(),
            granted: BTreeMap::new(),
        }
    }

    /// Main worker loop.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command);
                }
                else => break,
            }
        }
        debug!(target: "runtime::authority", granted = self.granted.len(), "id authority stopped");
    }

    fn handle_command(&mut self, command: AuthorityCommand) {
        match command {
            AuthorityCommand::Reserve { owner, reply } => {
                let range = self.reserve(owner);
                if reply.send(range).is_err() {
                    debug!(
                        target: "runtime::authority",
                        "Reserve reply channel closed (caller dropped)"
                    );
                }
            }
            AuthorityCommand::Overflow { replica, request } => self.record(replica, request),
            AuthorityCommand::Collect { effective, reply } => {
                let grants = self.grant_pending(effective);
                if reply.send(grants).is_err() {
                    debug!(
                        target: "runtime::authority",
                        "Collect reply channel closed (caller dropped)"
                    );
                }
            }
        }
    }

    fn reserve(&mut self, owner: OwnerKey) -> Option<IdRange> {
        let range = IdRange::new(self.next_start, self.block_size);
        let Some(end) = range.end() else {
            error!(
                target: "runtime::authority",
                %owner,
                next_start = self.next_start,
                "id space exhausted"
            );
            return None;
        };
        self.next_start = end;
        Some(range)
    }

    fn record(&mut self, replica: ReplicaId, request: OverflowRequest) {
        let key = (request.owner, request.exhausted_start);
        self.event_bus.publish(Event::Ids(IdEvent::OverflowRequested { replica, request }));

        if self.granted.contains_key(&key) || self.pending.contains_key(&key) {
            debug!(
                target: "runtime::authority",
                %replica,
                owner = %request.owner,
                start = request.exhausted_start,
                "duplicate overflow request"
            );
            return;
        }
        self.pending.insert(key, request);
    }

    /// Grants in `(owner, exhausted_start)` order so the resulting ranges
    /// do not depend on which replica reported first.
    fn grant_pending(&mut self, effective: Tick) -> Vec<BlockGrant> {
        let mut grants = Vec::new();
        while let Some((key, request)) = self.pending.pop_first() {
            let Some(range) = self.reserve(request.owner) else {
                self.pending.insert(key, request);
                break;
            };
            let grant = BlockGrant {
                owner: request.owner,
                range,
                replaces: Some(request.exhausted_start),
                effective,
            };
            info!(
                target: "runtime::authority",
                owner = %grant.owner,
                start = range.start,
                size = range.size,
                %effective,
                "granted replacement id block"
            );
            self.granted.insert(key, grant);
            self.event_bus.publish(Event::Ids(IdEvent::BlockGranted(grant)));
            grants.push(grant);
        }
        grants
    }
}
