//! Command scripts: commands to submit at given ticks.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use lockstep_core::Tick;
use runtime::SimCommand;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ScriptEntry {
    tick: u64,
    command: SimCommand,
}

/// Commands keyed by the tick they are submitted before.
#[derive(Debug, Default)]
pub struct Script {
    commands: BTreeMap<Tick, Vec<SimCommand>>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read command script {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid command script {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let entries: Vec<ScriptEntry> = serde_json::from_str(text)?;
        let mut commands: BTreeMap<Tick, Vec<SimCommand>> = BTreeMap::new();
        for entry in entries {
            commands.entry(Tick(entry.tick)).or_default().push(entry.command);
        }
        Ok(Self { commands })
    }

    /// Removes and returns the commands due at `tick`.
    pub fn take(&mut self, tick: Tick) -> Vec<SimCommand> {
        self.commands.remove(&tick).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.commands.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{ActorId, Cell, LocationId};

    #[test]
    fn entries_are_grouped_by_tick_in_file_order() {
        let mut script = Script::parse(
            r#"[
                {"tick": 2, "command": {"Dump": {"location": 1, "cell": {"x": 0, "y": 0}}}},
                {"tick": 1, "command": {"Build": {"actor": 2, "location": 1, "cell": {"x": 3, "y": 4}}}},
                {"tick": 2, "command": {"Gift": {"thing": 7, "to": 1}}}
            ]"#,
        )
        .unwrap();
        assert_eq!(script.len(), 3);

        assert_eq!(
            script.take(Tick(1)),
            vec![SimCommand::Build {
                actor: ActorId(2),
                location: LocationId(1),
                cell: Cell::new(3, 4),
            }]
        );
        assert_eq!(script.take(Tick(2)).len(), 2);
        assert!(script.take(Tick(2)).is_empty());
        assert!(script.is_empty());
    }

    #[test]
    fn malformed_scripts_are_rejected() {
        assert!(Script::parse(r#"[{"tick": 1}]"#).is_err());
    }
}
