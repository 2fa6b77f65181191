//! Graph configuration.
//!
//! One value object, handed to [`crate::ReplicationGraph`] at construction and
//! threaded down to the nodes. Nothing here is global or mutable after startup,
//! with the exception of the dynamic frequency bucket count, which the graph
//! exposes a setter for.

use crate::error::ConfigError;
use crate::repgraph_policy::RoutingCategory;
use serde::{Deserialize, Serialize};

// ============================================================================
// SPATIAL GRID
// ============================================================================

/// Settings for the spatial grid node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Edge length of a grid cell (default: 10000)
    pub cell_size: f64,

    /// World X of cell (0, 0) (default: -200000)
    pub bias_x: f64,

    /// World Y of cell (0, 0) (default: -200000)
    pub bias_y: f64,

    /// Freeze static cells after the first build (default: true)
    pub disable_spatial_rebuilds: bool,

    /// Buckets a crowded cell's dynamic list is spread across (default: 3)
    pub dynamic_frequency_buckets: u32,

    /// Dynamic list length above which a cell starts bucketing (default: 12)
    pub frequency_bucket_list_size: usize,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_size: 10_000.0,
            bias_x: -200_000.0,
            bias_y: -200_000.0,
            disable_spatial_rebuilds: true,
            dynamic_frequency_buckets: 3,
            frequency_bucket_list_size: 12,
        }
    }
}

// ============================================================================
// FAST SHARED PATH
// ============================================================================

/// Bandwidth budget for shared movement updates of pawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastSharedPathConfig {
    pub enabled: bool,

    /// Counted independently of the transport's own target bandwidth
    pub target_kbytes_per_sec: u32,

    /// Fraction of the cull distance inside which the fast path applies
    pub cull_distance_pct: f32,
}

impl Default for FastSharedPathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_kbytes_per_sec: 10,
            cull_distance_pct: 0.80,
        }
    }
}

// ============================================================================
// CLASS SETTINGS
// ============================================================================

/// Per-type override entry, matched against the registry by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassSettings {
    pub type_name: String,

    /// Record `mapping` as an explicit routing category for the type
    pub add_class_rep_info: bool,
    pub mapping: RoutingCategory,

    /// Record `multicast_opens_channel` for the type
    pub add_to_multicast_map: bool,
    pub multicast_opens_channel: bool,
}

impl ClassSettings {
    /// An explicit type -> category override.
    pub fn route(type_name: impl Into<String>, mapping: RoutingCategory) -> Self {
        Self {
            type_name: type_name.into(),
            mapping,
            ..Self::default()
        }
    }
}

impl Default for ClassSettings {
    fn default() -> Self {
        Self {
            type_name: String::new(),
            add_class_rep_info: true,
            mapping: RoutingCategory::NotRouted,
            add_to_multicast_map: false,
            multicast_opens_channel: true,
        }
    }
}

// ============================================================================
// GRAPH
// ============================================================================

/// Configuration for the replication graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Refuse to build a graph at all
    pub disabled: bool,

    pub class_settings: Vec<ClassSettings>,

    /// Type whose replication info is set explicitly from its own defaults
    pub base_pawn_type: Option<String>,

    pub spatial: SpatialConfig,
    pub fast_shared_path: FastSharedPathConfig,

    /// Max distance (not squared) to send destruction infos at (default: 30000)
    pub destruction_info_max_distance: f64,

    /// Status records the frequency limiter returns per tick (default: 2)
    pub status_records_per_tick: usize,

    /// Seconds of rewind history each entity keeps (default: 0.8)
    pub rewind_max_record_duration: f64,

    /// Server ticks per second, used to turn update rates into periods (default: 30)
    pub server_max_tick_rate: f64,

    pub log_lazy_init_types: bool,
    pub display_client_region_streaming: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            class_settings: Vec::new(),
            base_pawn_type: None,
            spatial: SpatialConfig::default(),
            fast_shared_path: FastSharedPathConfig::default(),
            destruction_info_max_distance: 30_000.0,
            status_records_per_tick: 2,
            rewind_max_record_duration: 0.8,
            server_max_tick_rate: 30.0,
            log_lazy_init_types: false,
            display_client_region_streaming: false,
        }
    }
}

impl GraphConfig {
    /// Parses and validates a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: GraphConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the nodes misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.spatial.cell_size > 0.0) {
            return Err(ConfigError::invalid("spatial.cell_size", "must be positive"));
        }
        if self.spatial.dynamic_frequency_buckets == 0 {
            return Err(ConfigError::invalid("spatial.dynamic_frequency_buckets", "must be at least 1"));
        }
        if self.status_records_per_tick == 0 {
            return Err(ConfigError::invalid("status_records_per_tick", "must be at least 1"));
        }
        if self.rewind_max_record_duration < 0.0 {
            return Err(ConfigError::invalid("rewind_max_record_duration", "must not be negative"));
        }
        if !(self.server_max_tick_rate > 0.0) {
            return Err(ConfigError::invalid("server_max_tick_rate", "must be positive"));
        }
        Ok(())
    }

    pub fn with_cell_size(mut self, cell_size: f64) -> Self {
        self.spatial.cell_size = cell_size;
        self
    }

    pub fn with_bias(mut self, x: f64, y: f64) -> Self {
        self.spatial.bias_x = x;
        self.spatial.bias_y = y;
        self
    }

    pub fn with_class_settings(mut self, settings: ClassSettings) -> Self {
        self.class_settings.push(settings);
        self
    }

    pub fn with_status_records_per_tick(mut self, target: usize) -> Self {
        self.status_records_per_tick = target;
        self
    }
}
