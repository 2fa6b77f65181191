//! Per-type replication defaults.
//!
//! Explicit entries are set at startup and never overwritten. Everything else
//! is derived by an injected [`TypeInfoProvider`], eagerly for the types the
//! registry lists and lazily for types first seen at runtime.

use crate::repgraph_policy::{ClassPolicyResolver, RoutingCategory, TypeHierarchy};
use repgraph_env::{TypeDescriptor, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Replication defaults shared by every entity of a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeReplicationInfo {
    /// 0 means not culled by distance
    pub cull_distance_squared: f64,

    /// Ticks between replications, at least 1
    pub replication_period: u32,

    pub distance_priority_scale: f32,
    pub starvation_priority_scale: f32,

    /// Ticks a channel may go without updates before it is closed
    pub channel_frame_timeout: u32,

    /// Name of the shared movement path, if the type uses one
    pub fast_shared_path: Option<String>,
}

impl Default for TypeReplicationInfo {
    fn default() -> Self {
        Self {
            cull_distance_squared: 0.0,
            replication_period: 1,
            distance_priority_scale: 1.0,
            starvation_priority_scale: 1.0,
            channel_frame_timeout: 4,
            fast_shared_path: None,
        }
    }
}

impl TypeReplicationInfo {
    pub fn cull_distance(&self) -> f64 {
        self.cull_distance_squared.sqrt()
    }

    /// Fields that differ from the defaults, or "Default".
    pub fn debug_string_delta(&self) -> String {
        let base = TypeReplicationInfo::default();
        let mut out = String::new();

        if self.distance_priority_scale != base.distance_priority_scale {
            let _ = write!(out, "DistanceScale: {:.2} ", self.distance_priority_scale);
        }
        if self.starvation_priority_scale != base.starvation_priority_scale {
            let _ = write!(out, "StarvationScale: {:.2} ", self.starvation_priority_scale);
        }
        if self.cull_distance_squared != base.cull_distance_squared {
            let _ = write!(out, "CullDist: {:.2} ", self.cull_distance());
        }
        if self.replication_period != base.replication_period {
            let _ = write!(out, "RepPeriod: {} ", self.replication_period);
        }
        if self.channel_frame_timeout != base.channel_frame_timeout {
            let _ = write!(out, "FrameTimeout: {} ", self.channel_frame_timeout);
        }
        if let Some(name) = &self.fast_shared_path {
            let _ = write!(out, "FastShared: {} ", name);
        }

        if out.is_empty() {
            "Default".to_string()
        } else {
            out.trim_end().to_string()
        }
    }
}

/// Ticks between replications for an update rate.
pub fn replication_period_for_frequency(server_max_tick_rate: f64, net_update_frequency: f64) -> u32 {
    if net_update_frequency <= 0.0 {
        return 1;
    }
    (server_max_tick_rate / net_update_frequency).round().max(1.0) as u32
}

/// Derives type info for types without an explicit entry.
pub trait TypeInfoProvider {
    /// Returns `None` to let the type inherit its parent's info.
    fn init_type_info(&self, desc: &TypeDescriptor, category: RoutingCategory) -> Option<TypeReplicationInfo>;
}

/// Cull distance from class defaults (spatialized types only) and a period
/// from the update frequency.
#[derive(Debug, Clone)]
pub struct DefaultTypeInfoProvider {
    pub server_max_tick_rate: f64,
}

impl DefaultTypeInfoProvider {
    pub fn new(server_max_tick_rate: f64) -> Self {
        Self { server_max_tick_rate }
    }
}

impl Default for DefaultTypeInfoProvider {
    fn default() -> Self {
        Self::new(30.0)
    }
}

impl TypeInfoProvider for DefaultTypeInfoProvider {
    fn init_type_info(&self, desc: &TypeDescriptor, category: RoutingCategory) -> Option<TypeReplicationInfo> {
        let mut info = TypeReplicationInfo::default();
        if category.is_spatialized() {
            info.cull_distance_squared = desc.defaults.net_cull_distance_squared;
        }
        info.replication_period =
            replication_period_for_frequency(self.server_max_tick_rate, desc.defaults.net_update_frequency);
        Some(info)
    }
}

/// Type -> info map with ancestor fallback.
pub struct TypeInfoMap {
    infos: HashMap<TypeId, TypeReplicationInfo>,
    explicit_types: Vec<TypeId>,
    provider: Box<dyn TypeInfoProvider + Send + Sync>,
    log_lazy_init: bool,
}

impl TypeInfoMap {
    pub fn new(provider: Box<dyn TypeInfoProvider + Send + Sync>, log_lazy_init: bool) -> Self {
        Self {
            infos: HashMap::new(),
            explicit_types: Vec::new(),
            provider,
            log_lazy_init,
        }
    }

    /// Sets an entry the provider will never touch, for the type or its subtypes.
    pub fn set_explicit(&mut self, ty: TypeId, info: TypeReplicationInfo) {
        self.infos.insert(ty, info);
        if !self.explicit_types.contains(&ty) {
            self.explicit_types.push(ty);
        }
    }

    pub fn is_explicitly_covered(&self, hierarchy: &TypeHierarchy, ty: TypeId) -> bool {
        self.explicit_types.iter().any(|e| hierarchy.is_child_of(ty, *e))
    }

    pub fn explicit_types(&self) -> &[TypeId] {
        &self.explicit_types
    }

    /// Startup pass for one replicated type.
    ///
    /// Stores the derived info unless it equals what the type would inherit.
    /// Returns true if an entry was stored.
    pub fn register(&mut self, hierarchy: &TypeHierarchy, resolver: &mut ClassPolicyResolver, ty: TypeId) -> bool {
        if self.is_explicitly_covered(hierarchy, ty) {
            return false;
        }
        let Some(desc) = hierarchy.get(ty) else {
            return false;
        };
        let category = resolver.resolve(hierarchy, Some(ty));
        let Some(info) = self.provider.init_type_info(desc, category) else {
            return false;
        };

        if let Some(parent) = desc.parent {
            if self.get(hierarchy, parent) == Some(&info) {
                return false;
            }
        }

        self.infos.insert(ty, info);
        true
    }

    /// Looks up a type's info, initializing it on first sight.
    ///
    /// Walks up until a stored entry is found or the provider produces one.
    /// Every type on the path is cached with the result.
    pub fn get_or_init(
        &mut self,
        hierarchy: &TypeHierarchy,
        resolver: &mut ClassPolicyResolver,
        ty: TypeId,
    ) -> TypeReplicationInfo {
        let mut path = Vec::new();
        let mut current = Some(ty);
        let mut created = false;

        let info = loop {
            let Some(id) = current else {
                break TypeReplicationInfo::default();
            };
            if let Some(info) = self.infos.get(&id) {
                break info.clone();
            }
            let Some(desc) = hierarchy.get(id) else {
                break TypeReplicationInfo::default();
            };
            path.push(id);

            if !self.is_explicitly_covered(hierarchy, id) {
                let category = resolver.resolve(hierarchy, Some(id));
                if let Some(info) = self.provider.init_type_info(desc, category) {
                    created = true;
                    break info;
                }
            }
            current = desc.parent;
        };

        if created && self.log_lazy_init {
            if let Some(initialized) = path.last() {
                let parent_delta = hierarchy
                    .parent(*initialized)
                    .and_then(|p| self.get(hierarchy, p))
                    .map(|p| p.debug_string_delta())
                    .unwrap_or_else(|| "None".to_string());
                tracing::debug!(
                    "Lazy init type {}: {} (parent: {})",
                    hierarchy.name(*initialized),
                    info.debug_string_delta(),
                    parent_delta
                );
            }
        }

        for id in path {
            self.infos.insert(id, info.clone());
        }
        info
    }

    /// Stored info for the type or its nearest ancestor with one.
    pub fn get(&self, hierarchy: &TypeHierarchy, ty: TypeId) -> Option<&TypeReplicationInfo> {
        let mut current = Some(ty);
        while let Some(id) = current {
            if let Some(info) = self.infos.get(&id) {
                return Some(info);
            }
            current = hierarchy.parent(id);
        }
        None
    }

    /// Entry stored for exactly this type.
    pub fn get_exact(&self, ty: TypeId) -> Option<&TypeReplicationInfo> {
        self.infos.get(&ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeReplicationInfo)> {
        self.infos.iter().map(|(id, info)| (*id, info))
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

impl std::fmt::Debug for TypeInfoMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfoMap")
            .field("infos", &self.infos)
            .field("explicit_types", &self.explicit_types)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use repgraph_env::{InMemoryTypeRegistry, TypeDefaults, TypeRegistry, TypeRole};

    struct Fixture {
        hierarchy: TypeHierarchy,
        resolver: ClassPolicyResolver,
        pawn: TypeId,
        hero: TypeId,
        crate_ty: TypeId,
        heavy_crate: TypeId,
    }

    fn fixture() -> Fixture {
        let mut registry = InMemoryTypeRegistry::new();
        let actor = registry
            .register("Actor", None, TypeRole::Actor, true, TypeDefaults::default())
            .unwrap();
        let pawn = registry
            .register("Pawn", Some(actor), TypeRole::Pawn, true, TypeDefaults::replicated().with_cull_distance(15_000.0))
            .unwrap();
        let hero = registry.derive("Hero", pawn).unwrap();
        let crate_ty = registry
            .register(
                "Crate",
                Some(actor),
                TypeRole::Actor,
                true,
                TypeDefaults::replicated().with_cull_distance(100.0).with_update_frequency(10.0),
            )
            .unwrap();
        let heavy_crate = registry.derive("HeavyCrate", crate_ty).unwrap();

        let mut hierarchy = TypeHierarchy::new();
        for desc in registry.list_replicated_types() {
            hierarchy.ensure_loaded(&registry, desc.id);
        }
        Fixture {
            hierarchy,
            resolver: ClassPolicyResolver::new(),
            pawn,
            hero,
            crate_ty,
            heavy_crate,
        }
    }

    fn map() -> TypeInfoMap {
        TypeInfoMap::new(Box::new(DefaultTypeInfoProvider::new(30.0)), false)
    }

    #[test]
    fn test_replication_period_rounding() {
        assert_eq!(replication_period_for_frequency(30.0, 100.0), 1);
        assert_eq!(replication_period_for_frequency(30.0, 10.0), 3);
        assert_eq!(replication_period_for_frequency(30.0, 4.0), 8);
        assert_eq!(replication_period_for_frequency(30.0, 0.0), 1);
    }

    #[test]
    fn test_debug_string_delta() {
        assert_eq!(TypeReplicationInfo::default().debug_string_delta(), "Default");

        let info = TypeReplicationInfo {
            replication_period: 3,
            cull_distance_squared: 10_000.0,
            ..TypeReplicationInfo::default()
        };
        assert_eq!(info.debug_string_delta(), "CullDist: 100.00 RepPeriod: 3");
        assert_relative_eq!(info.cull_distance(), 100.0);
    }

    #[test]
    fn test_default_provider_culls_only_spatialized() {
        let f = fixture();
        let provider = DefaultTypeInfoProvider::default();
        let desc = f.hierarchy.get(f.crate_ty).unwrap();

        let spatial = provider.init_type_info(desc, RoutingCategory::SpatializeDynamic).unwrap();
        assert_relative_eq!(spatial.cull_distance_squared, 10_000.0);
        assert_eq!(spatial.replication_period, 3);

        let global = provider.init_type_info(desc, RoutingCategory::RelevantAllConnections).unwrap();
        assert_eq!(global.cull_distance_squared, 0.0);
    }

    #[test]
    fn test_explicit_info_survives_derived_pass() {
        let mut f = fixture();
        let mut infos = map();
        let explicit = TypeReplicationInfo {
            cull_distance_squared: 42.0,
            ..TypeReplicationInfo::default()
        };
        infos.set_explicit(f.pawn, explicit.clone());

        assert!(!infos.register(&f.hierarchy, &mut f.resolver, f.pawn));
        assert!(!infos.register(&f.hierarchy, &mut f.resolver, f.hero));
        assert_eq!(infos.get_exact(f.pawn), Some(&explicit));
        assert_eq!(infos.get_or_init(&f.hierarchy, &mut f.resolver, f.hero), explicit);
    }

    #[test]
    fn test_register_skips_info_equal_to_parent() {
        let mut f = fixture();
        let mut infos = map();

        assert!(infos.register(&f.hierarchy, &mut f.resolver, f.crate_ty));
        assert!(!infos.register(&f.hierarchy, &mut f.resolver, f.heavy_crate));
        assert_eq!(infos.get(&f.hierarchy, f.heavy_crate).unwrap().replication_period, 3);
    }

    #[test]
    fn test_lazy_init_on_first_sight() {
        let mut f = fixture();
        let mut infos = map();
        assert!(infos.is_empty());

        let info = infos.get_or_init(&f.hierarchy, &mut f.resolver, f.heavy_crate);
        assert_eq!(info.replication_period, 3);
        assert_eq!(infos.get_exact(f.heavy_crate), Some(&info));
        assert_eq!(infos.get_or_init(&f.hierarchy, &mut f.resolver, TypeId(77)), TypeReplicationInfo::default());
    }
}
