//! Replication scenarios for the simulator.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// RG-001: moving crowd, grid soundness and per-connection essentials
    Crowd,

    /// RG-002: region-gated always-relevant lists following visibility
    Streaming,

    /// RG-003: many status records rotated through the frequency limiter
    StatusFlood,

    /// RG-004: lag-compensated lookups against recorded trajectories
    Rewind,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Crowd,
            ScenarioId::Streaming,
            ScenarioId::StatusFlood,
            ScenarioId::Rewind,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Crowd => "crowd",
            ScenarioId::Streaming => "streaming",
            ScenarioId::StatusFlood => "status_flood",
            ScenarioId::Rewind => "rewind",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Crowd => "Moving pawns and props, pawn respawns, cull distance bounds per connection",
            ScenarioId::Streaming => "Regions toggled visible and hidden, region entities follow visibility",
            ScenarioId::StatusFlood => "Status records rotated a few per tick, every one reaches every connection",
            ScenarioId::Rewind => "Pawn histories queried at recorded and interpolated times",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crowd" | "rg-001" => Ok(ScenarioId::Crowd),
            "streaming" | "rg-002" => Ok(ScenarioId::Streaming),
            "status_flood" | "statusflood" | "rg-003" => Ok(ScenarioId::StatusFlood),
            "rewind" | "rg-004" => Ok(ScenarioId::Rewind),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
