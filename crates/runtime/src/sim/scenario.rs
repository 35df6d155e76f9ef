use lockstep_core::{ActorId, Cell, LocationId};
use serde::{Deserialize, Serialize};

/// Initial layout shared by every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub factions: u32,
    pub locations: u32,
    pub pawns_per_faction: u32,
}

impl ScenarioConfig {
    pub const DEFAULT_FACTIONS: u32 = 2;
    pub const DEFAULT_LOCATIONS: u32 = 2;
    pub const DEFAULT_PAWNS_PER_FACTION: u32 = 3;
    /// Rows between neighbouring faction bases.
    pub const BASE_SPACING: i64 = 6;

    pub fn actors(&self) -> impl Iterator<Item = ActorId> {
        (1..=self.factions.max(1)).map(ActorId)
    }

    pub fn locations(&self) -> impl Iterator<Item = LocationId> {
        (1..=self.locations.max(1)).map(LocationId)
    }

    /// Location a faction starts in. Factions outnumbering locations share one.
    pub fn home_of(&self, actor: ActorId) -> LocationId {
        LocationId(actor.0.saturating_sub(1) % self.locations.max(1) + 1)
    }

    /// Centre of a faction's starting area. Bases stack along y, six cells
    /// apart, and pin to the grid edge for very large faction ids.
    pub fn base_cell(&self, actor: ActorId) -> Cell {
        let row = i64::from(actor.0.saturating_sub(1)) * Self::BASE_SPACING;
        Cell::new(0, i32::try_from(row).unwrap_or(i32::MAX))
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            factions: Self::DEFAULT_FACTIONS,
            locations: Self::DEFAULT_LOCATIONS,
            pawns_per_faction: Self::DEFAULT_PAWNS_PER_FACTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factions_wrap_around_locations() {
        let scenario = ScenarioConfig {
            factions: 3,
            locations: 2,
            pawns_per_faction: 1,
        };
        let homes: Vec<_> = scenario.actors().map(|actor| scenario.home_of(actor)).collect();
        assert_eq!(homes, vec![LocationId(1), LocationId(2), LocationId(1)]);
    }

    #[test]
    fn bases_stay_on_the_grid_for_any_faction() {
        let scenario = ScenarioConfig::default();
        assert_eq!(scenario.base_cell(ActorId(1)), Cell::ORIGIN);
        assert_eq!(scenario.base_cell(ActorId(3)), Cell::new(0, 12));
        assert_eq!(scenario.base_cell(ActorId(0)), Cell::ORIGIN);
        assert_eq!(scenario.base_cell(ActorId(u32::MAX)), Cell::new(0, i32::MAX));
    }
}
