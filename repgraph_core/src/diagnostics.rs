//! Routing diagnostics.
//!
//! A snapshot of how every known type is routed and which replication
//! settings it ended up with, printable as text or serializable as JSON.

use crate::graph_runtime::ReplicationGraph;
use crate::repgraph_policy::RoutingCategory;
use crate::repgraph_space::GridStats;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyRow {
    pub type_name: String,
    pub native_parent: String,
    pub category: RoutingCategory,
    pub native_parent_category: Option<RoutingCategory>,
    pub explicit: bool,
}

impl PolicyRow {
    fn is_native(&self) -> bool {
        self.type_name == self.native_parent
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassSettingsRow {
    pub type_name: String,
    pub native_parent: String,
    pub replication_period: u32,
    pub cull_distance: f64,
    pub delta: String,
}

/// Type routing and settings at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingReport {
    pub policies: Vec<PolicyRow>,
    pub class_settings: Vec<ClassSettingsRow>,
    pub grid: GridStats,
    pub entity_count: usize,
    pub connection_count: usize,
}

impl RoutingReport {
    pub fn build(graph: &ReplicationGraph) -> Self {
        let hierarchy = graph.hierarchy();
        let policies = graph.policies();
        let native_name = |ty| {
            hierarchy
                .parent_native(ty)
                .map(|n| hierarchy.name(n).to_string())
                .unwrap_or_else(|| "<none>".to_string())
        };

        let mut policy_rows: Vec<PolicyRow> = policies
            .iter()
            .map(|(ty, category)| {
                let native = hierarchy.parent_native(ty);
                PolicyRow {
                    type_name: hierarchy.name(ty).to_string(),
                    native_parent: native_name(ty),
                    category,
                    native_parent_category: native.and_then(|n| policies.get(n)),
                    explicit: policies.is_explicit(ty),
                }
            })
            .collect();
        policy_rows.sort_by(|a, b| a.type_name.cmp(&b.type_name));

        let mut settings_rows: Vec<ClassSettingsRow> = graph
            .type_infos()
            .iter()
            .map(|(ty, info)| ClassSettingsRow {
                type_name: hierarchy.name(ty).to_string(),
                native_parent: native_name(ty),
                replication_period: info.replication_period,
                cull_distance: info.cull_distance(),
                delta: info.debug_string_delta(),
            })
            .collect();
        settings_rows.sort_by(|a, b| a.type_name.cmp(&b.type_name));

        Self {
            policies: policy_rows,
            class_settings: settings_rows,
            grid: graph.grid_stats(),
            entity_count: graph.entity_count(),
            connection_count: graph.connection_count(),
        }
    }

    /// Native types, and derived types routed differently from their native parent.
    pub fn differing_from_native(&self) -> Vec<&PolicyRow> {
        self.policies
            .iter()
            .filter(|row| row.is_native() || row.native_parent_category != Some(row.category))
            .collect()
    }

    pub fn category_of(&self, type_name: &str) -> Option<RoutingCategory> {
        self.policies
            .iter()
            .find(|row| row.type_name == type_name)
            .map(|row| row.category)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for RoutingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "━━━ Game Replication Routing Policies ━━━")?;
        for row in &self.policies {
            writeln!(f, "{:<40} --> {}", row.type_name, row.category)?;
        }

        writeln!(f)?;
        writeln!(f, "━━━ Class Settings Map ━━━")?;
        for row in &self.class_settings {
            writeln!(f, "  {} ({}) -> {}", row.type_name, row.native_parent, row.delta)?;
        }

        writeln!(f)?;
        write!(
            f,
            "Grid: {} entities in {} cells ({} static, {} dynamic), {} registered, {} connections",
            self.grid.total_entities,
            self.grid.occupied_cells,
            self.grid.static_entities,
            self.grid.dynamic_entities,
            self.entity_count,
            self.connection_count
        )
    }
}
