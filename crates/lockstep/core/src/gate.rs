//! Tick and command classification.
//!
//! The core asks a [`TickGate`] whether execution is tick-driven, replaying a
//! buffered command, or interactive. [`CommandGate`] is the in-process
//! implementation: it buffers externally sourced commands by tick and marks
//! the span in which they are replayed.
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;

use crate::state::Tick;

/// How the simulation is currently being driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecutionPhase {
    /// Outside of any tick or command replay (UI, local-only code).
    Interactive,
    /// Tick-driven simulation.
    Ticking,
    /// A buffered command is being applied; takes precedence over ticking.
    ReplayingCommand,
}

impl ExecutionPhase {
    /// Returns true if state mutations in this phase happen on every replica.
    pub const fn is_replicated(&self) -> bool {
        !matches!(self, Self::Interactive)
    }
}

/// Source of tick and command classification consumed by the core.
pub trait TickGate {
    fn current_tick(&self) -> Tick;

    fn is_executing_buffered_command(&self) -> bool;

    fn is_ticking(&self) -> bool;

    fn phase(&self) -> ExecutionPhase {
        if self.is_executing_buffered_command() {
            ExecutionPhase::ReplayingCommand
        } else if self.is_ticking() {
            ExecutionPhase::Ticking
        } else {
            ExecutionPhase::Interactive
        }
    }
}

/// Buffers commands until their tick and tracks the execution phase.
pub struct CommandGate<C> {
    tick: Cell<Tick>,
    ticking: Cell<bool>,
    replaying: Cell<bool>,
    buffered: RefCell<BTreeMap<Tick, Vec<C>>>,
}

impl<C> CommandGate<C> {
    pub fn new() -> Self {
        Self {
            tick: Cell::new(Tick::ZERO),
            ticking: Cell::new(false),
            replaying: Cell::new(false),
            buffered: RefCell::new(BTreeMap::new()),
        }
    }

    /// Buffers `command` for release at tick `at`.
    pub fn submit(&self, at: Tick, command: C) {
        self.buffered
            .borrow_mut()
            .entry(at)
            .or_default()
            .push(command);
    }

    /// Number of commands not yet released.
    pub fn pending(&self) -> usize {
        self.buffered.borrow().values().map(Vec::len).sum()
    }

    /// Marks `tick` as the tick being simulated.
    ///
    /// Ticking ends when the returned guard is dropped or
    /// [`CommandGate::end_tick`] is called.
    pub fn begin_tick(&self, tick: Tick) -> TickGuard<'_, C> {
        self.tick.set(tick);
        self.ticking.set(true);
        TickGuard { gate: self }
    }

    pub fn end_tick(&self) {
        self.ticking.set(false);
    }

    /// Removes and returns every command due at or before `tick`, ordered by
    /// tick and then by submission.
    pub fn release(&self, tick: Tick) -> Vec<C> {
        let mut buffered = self.buffered.borrow_mut();
        let later = match tick.0.checked_add(1) {
            Some(next) => buffered.split_off(&Tick(next)),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut *buffered, later);
        due.into_values().flatten().collect()
    }

    /// Releases the commands due at `tick` and applies each with the
    /// buffered-command flag set. Returns how many were applied.
    pub fn replay<F>(&self, tick: Tick, mut apply: F) -> usize
    where
        F: FnMut(C),
    {
        let due = self.release(tick);
        let count = due.len();
        for command in due {
            self.replaying(|| apply(command));
        }
        count
    }

    /// Runs `f` with the buffered-command flag set, restoring the previous
    /// value on every exit path.
    pub fn replaying<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = ReplayGuard {
            flag: &self.replaying,
            previous: self.replaying.replace(true),
        };
        f()
    }
}

impl<C> TickGate for CommandGate<C> {
    fn current_tick(&self) -> Tick {
        self.tick.get()
    }

    fn is_executing_buffered_command(&self) -> bool {
        self.replaying.get()
    }

    fn is_ticking(&self) -> bool {
        self.ticking.get()
    }
}

impl<C> Default for CommandGate<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for CommandGate<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGate")
            .field("tick", &self.tick.get())
            .field("phase", &self.phase())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Ends the tick on drop.
#[must_use = "dropping the guard immediately ends the tick"]
pub struct TickGuard<'a, C> {
    gate: &'a CommandGate<C>,
}

impl<C> Drop for TickGuard<'_, C> {
    fn drop(&mut self) {
        self.gate.end_tick();
    }
}

struct ReplayGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_follows_tick_and_replay_flags() {
        let gate: CommandGate<u8> = CommandGate::new();
        assert_eq!(gate.phase(), ExecutionPhase::Interactive);

        {
            let _tick = gate.begin_tick(Tick(5));
            assert_eq!(gate.phase(), ExecutionPhase::Ticking);
            assert_eq!(gate.current_tick(), Tick(5));

            gate.replaying(|| assert_eq!(gate.phase(), ExecutionPhase::ReplayingCommand));
            assert_eq!(gate.phase(), ExecutionPhase::Ticking);
        }

        assert_eq!(gate.phase(), ExecutionPhase::Interactive);
        assert_eq!(gate.current_tick(), Tick(5));
    }

    #[test]
    fn release_returns_due_commands_in_submission_order() {
        let gate = CommandGate::new();
        gate.submit(Tick(2), "b1");
        gate.submit(Tick(1), "a1");
        gate.submit(Tick(3), "c1");
        gate.submit(Tick(2), "b2");

        assert_eq!(gate.release(Tick(0)), Vec::<&str>::new());
        assert_eq!(gate.release(Tick(2)), vec!["a1", "b1", "b2"]);
        assert_eq!(gate.pending(), 1);
        assert_eq!(gate.release(Tick(u64::MAX)), vec!["c1"]);
    }

    #[test]
    fn replay_flag_is_reset_when_command_panics() {
        let gate = CommandGate::new();
        gate.submit(Tick(1), 1u8);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.replay(Tick(1), |_| panic!("command failed"));
        }));

        assert!(result.is_err());
        assert!(!gate.is_executing_buffered_command());
    }

    #[test]
    fn replay_applies_each_due_command_as_buffered() {
        let gate = CommandGate::new();
        gate.submit(Tick(4), 10u32);
        gate.submit(Tick(4), 20u32);

        let mut seen = Vec::new();
        let applied = gate.replay(Tick(4), |cmd| {
            seen.push((cmd, gate.is_executing_buffered_command()));
        });

        assert_eq!(applied, 2);
        assert_eq!(seen, vec![(10, true), (20, true)]);
    }
}
