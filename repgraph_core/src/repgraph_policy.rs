//! Class Policy Resolver - Type to routing category mapping
//!
//! Every replicated type is routed to exactly one place in the graph. The
//! mapping is decided once per type and memoized:
//!
//! 1. Explicit overrides (class settings) always win.
//! 2. A type whose relevance flags match its parent's shares the parent's
//!    mapping.
//! 3. Anything else is classified from its own flags.
//!
//! The type hierarchy is an arena indexed by [`TypeId`] with parent links, so
//! resolution is an iterative walk rather than recursion over a class graph.

use repgraph_env::{TypeDefaults, TypeDescriptor, TypeId, TypeRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where an entity of a given type is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingCategory {
    /// Not routed anywhere (handled by special nodes or not at all)
    NotRouted,
    /// Relevant to every connection
    RelevantAllConnections,

    // Spatialized categories, keep these last
    /// Routed to the grid, never moves
    SpatializeStatic,
    /// Routed to the grid, moves every tick
    SpatializeDynamic,
    /// Routed to the grid, static while dormant and dynamic while awake
    SpatializeDormancy,
}

impl RoutingCategory {
    /// Every category, in declaration order.
    pub const ALL: [RoutingCategory; 5] = [
        RoutingCategory::NotRouted,
        RoutingCategory::RelevantAllConnections,
        RoutingCategory::SpatializeStatic,
        RoutingCategory::SpatializeDynamic,
        RoutingCategory::SpatializeDormancy,
    ];

    pub fn is_spatialized(self) -> bool {
        self >= RoutingCategory::SpatializeStatic
    }

    pub fn name(self) -> &'static str {
        match self {
            RoutingCategory::NotRouted => "NotRouted",
            RoutingCategory::RelevantAllConnections => "RelevantAllConnections",
            RoutingCategory::SpatializeStatic => "Spatialize_Static",
            RoutingCategory::SpatializeDynamic => "Spatialize_Dynamic",
            RoutingCategory::SpatializeDormancy => "Spatialize_Dormancy",
        }
    }

    /// Direct classification from a type's own flags.
    pub fn classify(defaults: &TypeDefaults) -> Self {
        if !defaults.replicated {
            return RoutingCategory::NotRouted;
        }
        let owner_scoped =
            defaults.always_relevant || defaults.only_relevant_to_owner || defaults.net_use_owner_relevancy;
        if !owner_scoped {
            RoutingCategory::SpatializeDynamic
        } else if defaults.always_relevant && !defaults.only_relevant_to_owner {
            RoutingCategory::RelevantAllConnections
        } else {
            RoutingCategory::NotRouted
        }
    }
}

impl std::fmt::Display for RoutingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// TYPE HIERARCHY
// ============================================================================

/// Arena of known type descriptors, indexed by [`TypeId`].
#[derive(Debug, Clone, Default)]
pub struct TypeHierarchy {
    types: Vec<Option<TypeDescriptor>>,
}

impl TypeHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, desc: TypeDescriptor) {
        let index = desc.id.index();
        if index >= self.types.len() {
            self.types.resize(index + 1, None);
        }
        self.types[index] = Some(desc);
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(id.index()).and_then(Option::as_ref)
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.get(id).is_some()
    }

    pub fn parent(&self, id: TypeId) -> Option<TypeId> {
        self.get(id).and_then(|d| d.parent)
    }

    pub fn name(&self, id: TypeId) -> &str {
        self.get(id).map(|d| d.name.as_str()).unwrap_or("<unknown>")
    }

    /// True if `id` is `ancestor` or descends from it.
    pub fn is_child_of(&self, id: TypeId, ancestor: TypeId) -> bool {
        let mut current = Some(id);
        while let Some(ty) = current {
            if ty == ancestor {
                return true;
            }
            current = self.parent(ty);
        }
        false
    }

    /// Nearest native type at or above `id`.
    pub fn parent_native(&self, id: TypeId) -> Option<TypeId> {
        let mut current = Some(id);
        while let Some(ty) = current {
            let desc = self.get(ty)?;
            if desc.native {
                return Some(ty);
            }
            current = desc.parent;
        }
        None
    }

    /// Pulls `id` and its missing ancestors from the registry.
    ///
    /// Returns false if the registry does not know the type.
    pub fn ensure_loaded(&mut self, registry: &dyn TypeRegistry, id: TypeId) -> bool {
        let mut current = Some(id);
        while let Some(ty) = current {
            if let Some(desc) = self.get(ty) {
                current = desc.parent;
                continue;
            }
            match registry.describe(ty) {
                Some(desc) => {
                    current = desc.parent;
                    self.insert(desc);
                }
                None => break,
            }
        }
        self.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.iter().flatten()
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Memoized type -> category resolution.
#[derive(Debug, Clone, Default)]
pub struct ClassPolicyResolver {
    policies: HashMap<TypeId, RoutingCategory>,
    explicit: HashSet<TypeId>,
}

impl ClassPolicyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an override. Cached mappings of subtypes are dropped so they
    /// pick the override up on their next resolve.
    pub fn set_explicit(&mut self, hierarchy: &TypeHierarchy, ty: TypeId, category: RoutingCategory) {
        if let Some(desc) = hierarchy.get(ty) {
            if category.is_spatialized() && desc.defaults.always_relevant {
                tracing::warn!(
                    "Type {} is always relevant but is mapped to {}. It will be culled by distance.",
                    desc.name,
                    category
                );
            }
        }

        let explicit = &self.explicit;
        self.policies
            .retain(|id, _| *id == ty || explicit.contains(id) || !hierarchy.is_child_of(*id, ty));
        self.policies.insert(ty, category);
        self.explicit.insert(ty);
    }

    /// Resolves and caches the mapping of a replicated type.
    pub fn register(&mut self, hierarchy: &TypeHierarchy, ty: TypeId) -> RoutingCategory {
        self.resolve(hierarchy, Some(ty))
    }

    /// Resolves a type, walking up while the relevance flags match the parent.
    ///
    /// Every type on the walked path is cached with the result.
    pub fn resolve(&mut self, hierarchy: &TypeHierarchy, ty: Option<TypeId>) -> RoutingCategory {
        let Some(ty) = ty else {
            return RoutingCategory::NotRouted;
        };

        let mut path = Vec::new();
        let mut current = ty;
        let category = loop {
            if let Some(category) = self.policies.get(&current) {
                break *category;
            }
            let Some(desc) = hierarchy.get(current) else {
                break RoutingCategory::NotRouted;
            };
            path.push(current);

            if !desc.defaults.replicated {
                break RoutingCategory::NotRouted;
            }
            match desc.parent.and_then(|p| hierarchy.get(p)) {
                Some(parent) if parent.defaults.same_relevancy(&desc.defaults) => current = parent.id,
                _ => break RoutingCategory::classify(&desc.defaults),
            }
        };

        for id in path {
            self.policies.insert(id, category);
        }
        category
    }

    /// Cached mapping, without resolving.
    pub fn get(&self, ty: TypeId) -> Option<RoutingCategory> {
        self.policies.get(&ty).copied()
    }

    pub fn is_explicit(&self, ty: TypeId) -> bool {
        self.explicit.contains(&ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, RoutingCategory)> + '_ {
        self.policies.iter().map(|(id, c)| (*id, *c))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use repgraph_env::{InMemoryTypeRegistry, TypeRole};

    fn hierarchy_of(registry: &InMemoryTypeRegistry) -> TypeHierarchy {
        let mut hierarchy = TypeHierarchy::new();
        for i in 0..registry.len() {
            hierarchy.ensure_loaded(registry, TypeId(i as u32));
        }
        hierarchy
    }

    fn sample_registry() -> (InMemoryTypeRegistry, TypeId, TypeId, TypeId, TypeId) {
        let mut registry = InMemoryTypeRegistry::new();
        let actor = registry
            .register("Actor", None, TypeRole::Actor, true, TypeDefaults::default())
            .unwrap();
        let projectile = registry
            .register("Projectile", Some(actor), TypeRole::Actor, true, TypeDefaults::replicated())
            .unwrap();
        let rocket = registry.derive("Rocket", projectile).unwrap();
        let info = registry
            .register(
                "GameInfo",
                Some(actor),
                TypeRole::Actor,
                true,
                TypeDefaults::replicated().with_always_relevant(true),
            )
            .unwrap();
        (registry, actor, projectile, rocket, info)
    }

    #[test]
    fn test_classify_flags() {
        assert_eq!(RoutingCategory::classify(&TypeDefaults::default()), RoutingCategory::NotRouted);
        assert_eq!(
            RoutingCategory::classify(&TypeDefaults::replicated()),
            RoutingCategory::SpatializeDynamic
        );
        assert_eq!(
            RoutingCategory::classify(&TypeDefaults::replicated().with_always_relevant(true)),
            RoutingCategory::RelevantAllConnections
        );
        assert_eq!(
            RoutingCategory::classify(
                &TypeDefaults::replicated()
                    .with_always_relevant(true)
                    .with_only_relevant_to_owner(true)
            ),
            RoutingCategory::NotRouted
        );
        assert_eq!(
            RoutingCategory::classify(&TypeDefaults::replicated().with_owner_relevancy(true)),
            RoutingCategory::NotRouted
        );
    }

    #[test]
    fn test_is_spatialized() {
        assert!(!RoutingCategory::NotRouted.is_spatialized());
        assert!(!RoutingCategory::RelevantAllConnections.is_spatialized());
        assert!(RoutingCategory::SpatializeStatic.is_spatialized());
        assert!(RoutingCategory::SpatializeDormancy.is_spatialized());
    }

    #[test]
    fn test_subtype_with_same_flags_follows_parent() {
        let (registry, _, projectile, rocket, info) = sample_registry();
        let hierarchy = hierarchy_of(&registry);
        let mut resolver = ClassPolicyResolver::new();

        resolver.set_explicit(&hierarchy, projectile, RoutingCategory::SpatializeStatic);

        assert_eq!(resolver.resolve(&hierarchy, Some(rocket)), RoutingCategory::SpatializeStatic);
        assert_eq!(resolver.get(rocket), Some(RoutingCategory::SpatializeStatic));
        assert!(!resolver.is_explicit(rocket));
        assert_eq!(resolver.resolve(&hierarchy, Some(info)), RoutingCategory::RelevantAllConnections);
    }

    #[test]
    fn test_explicit_override_invalidates_cached_subtypes() {
        let (registry, _, projectile, rocket, _) = sample_registry();
        let hierarchy = hierarchy_of(&registry);
        let mut resolver = ClassPolicyResolver::new();

        assert_eq!(resolver.resolve(&hierarchy, Some(rocket)), RoutingCategory::SpatializeDynamic);
        resolver.set_explicit(&hierarchy, projectile, RoutingCategory::NotRouted);
        assert_eq!(resolver.resolve(&hierarchy, Some(rocket)), RoutingCategory::NotRouted);
    }

    #[test]
    fn test_unknown_and_missing_types_not_routed() {
        let hierarchy = TypeHierarchy::new();
        let mut resolver = ClassPolicyResolver::new();
        assert_eq!(resolver.resolve(&hierarchy, None), RoutingCategory::NotRouted);
        assert_eq!(resolver.resolve(&hierarchy, Some(TypeId(42))), RoutingCategory::NotRouted);
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_hierarchy_walks() {
        let (registry, actor, projectile, rocket, info) = sample_registry();
        let hierarchy = hierarchy_of(&registry);

        assert!(hierarchy.is_child_of(rocket, actor));
        assert!(hierarchy.is_child_of(rocket, rocket));
        assert!(!hierarchy.is_child_of(info, projectile));
        assert_eq!(hierarchy.parent_native(rocket), Some(projectile));
        assert_eq!(hierarchy.parent_native(actor), Some(actor));
    }

    #[test]
    fn test_ensure_loaded_pulls_ancestors() {
        let (registry, actor, projectile, rocket, _) = sample_registry();
        let mut hierarchy = TypeHierarchy::new();

        assert!(hierarchy.ensure_loaded(&registry, rocket));
        assert!(hierarchy.contains(projectile));
        assert!(hierarchy.contains(actor));
        assert!(!hierarchy.ensure_loaded(&registry, TypeId(99)));
    }

    proptest! {
        /// Random chains: resolve is stable and equal-flag children match parents.
        #[test]
        fn prop_resolve_idempotent(flags in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()), 1..12)) {
            let mut registry = InMemoryTypeRegistry::new();
            let mut parent = None;
            let mut ids = Vec::new();
            for (i, (replicated, always, owner_only, owner_rel)) in flags.iter().enumerate() {
                let defaults = TypeDefaults {
                    replicated: *replicated,
                    always_relevant: *always,
                    only_relevant_to_owner: *owner_only,
                    net_use_owner_relevancy: *owner_rel,
                    ..TypeDefaults::default()
                };
                let id = registry
                    .register(&format!("T{i}"), parent, TypeRole::Actor, i % 2 == 0, defaults)
                    .unwrap();
                ids.push(id);
                parent = Some(id);
            }

            let hierarchy = hierarchy_of(&registry);
            let mut resolver = ClassPolicyResolver::new();

            for id in ids.iter().rev() {
                let first = resolver.resolve(&hierarchy, Some(*id));
                let second = resolver.resolve(&hierarchy, Some(*id));
                prop_assert_eq!(first, second);
            }

            for pair in ids.windows(2) {
                let parent = hierarchy.get(pair[0]).unwrap().defaults;
                let child = hierarchy.get(pair[1]).unwrap().defaults;
                if child.replicated && parent.same_relevancy(&child) {
                    prop_assert_eq!(
                        resolver.resolve(&hierarchy, Some(pair[1])),
                        resolver.resolve(&hierarchy, Some(pair[0]))
                    );
                }
            }
        }
    }
}
