//! Engine registry: the static dispatch table built once at startup.
//!
//! Holds every [`EngineDescriptor`] in declaration order next to its
//! `Arc<dyn Engine>` implementation. After construction the registry is
//! wrapped in an `Arc` and only read, so lookups need no locking.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use engines::Engine;
use tracing::info;

use crate::planner::{plan_waves, PlanNode};
use crate::{ConfigurationError, EngineDescriptor};

#[derive(Default)]
pub struct EngineRegistry {
    descriptors: Vec<EngineDescriptor>,
    engines: Vec<Arc<dyn Engine>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single engine. Its dependencies must already be registered.
    ///
    /// # Errors
    /// - [`ConfigurationError::DuplicateEngine`] if the name is taken.
    /// - [`ConfigurationError::CyclicDependency`] if it depends on itself.
    /// - [`ConfigurationError::InvalidDependency`] if a dependency is unknown.
    pub fn register(
        &mut self,
        descriptor: EngineDescriptor,
        engine: Arc<dyn Engine>,
    ) -> Result<(), ConfigurationError> {
        check_name(&descriptor.name)?;
        if self.index.contains_key(&descriptor.name) {
            return Err(ConfigurationError::DuplicateEngine(descriptor.name));
        }
        if descriptor.depends_on.contains(&descriptor.name) {
            return Err(ConfigurationError::CyclicDependency {
                engines: vec![descriptor.name],
            });
        }
        if let Some(dep) = descriptor.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
            return Err(ConfigurationError::InvalidDependency {
                engine: descriptor.name.clone(),
                dependency: dep.clone(),
            });
        }

        self.insert(descriptor, engine);
        Ok(())
    }

    /// Register a batch in any order. Either every entry is registered or
    /// none is.
    ///
    /// # Errors
    /// Same as [`register`](Self::register), with cycles anywhere in the batch
    /// reported as [`ConfigurationError::CyclicDependency`].
    pub fn register_all(
        &mut self,
        entries: Vec<(EngineDescriptor, Arc<dyn Engine>)>,
    ) -> Result<(), ConfigurationError> {
        // -------------------------------------------------------------------
        // 1. Names are unique across the registry and the batch
        // -------------------------------------------------------------------
        let mut batch_names: HashSet<&str> = HashSet::new();
        for (descriptor, _) in &entries {
            let name = descriptor.name.as_str();
            check_name(name)?;
            if self.index.contains_key(name) || !batch_names.insert(name) {
                return Err(ConfigurationError::DuplicateEngine(name.to_owned()));
            }
        }

        // -------------------------------------------------------------------
        // 2. Every dependency resolves somewhere
        // -------------------------------------------------------------------
        for (descriptor, _) in &entries {
            for dep in &descriptor.depends_on {
                if !self.index.contains_key(dep) && !batch_names.contains(dep.as_str()) {
                    return Err(ConfigurationError::InvalidDependency {
                        engine: descriptor.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // -------------------------------------------------------------------
        // 3. The batch is acyclic (existing engines can't depend on new ones)
        // -------------------------------------------------------------------
        let nodes: Vec<PlanNode<'_>> = entries
            .iter()
            .map(|(descriptor, _)| PlanNode {
                name: descriptor.name.as_str(),
                depends_on: descriptor.depends_on.iter().map(String::as_str).collect(),
            })
            .collect();
        plan_waves(&nodes)?;

        for (descriptor, engine) in entries {
            self.insert(descriptor, engine);
        }
        Ok(())
    }

    fn insert(&mut self, descriptor: EngineDescriptor, engine: Arc<dyn Engine>) {
        info!(
            engine = %descriptor.name,
            depends_on = ?descriptor.depends_on,
            cacheable = descriptor.cacheable,
            "registered engine"
        );
        self.index.insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        self.engines.push(engine);
    }

    /// Transitive closure of everything needed to produce `goal`, goal
    /// engines included.
    ///
    /// # Errors
    /// [`ConfigurationError::UnknownGoal`] if a goal isn't registered.
    pub fn resolve<S: AsRef<str>>(&self, goal: &[S]) -> Result<BTreeSet<String>, ConfigurationError> {
        let mut required = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for name in goal {
            let name = name.as_ref();
            if !self.index.contains_key(name) {
                return Err(ConfigurationError::UnknownGoal(name.to_owned()));
            }
            stack.push(name);
        }

        while let Some(name) = stack.pop() {
            if !required.insert(name.to_owned()) {
                continue;
            }
            if let Some(descriptor) = self.descriptor(name) {
                stack.extend(descriptor.depends_on.iter().map(String::as_str));
            }
        }

        Ok(required)
    }

    /// Engines among `within` that depend, directly or transitively, on any
    /// engine in `seeds`. Seeds themselves are included.
    pub fn dependents_closure(
        &self,
        seeds: &BTreeSet<String>,
        within: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut closure = seeds.clone();
        loop {
            let grown: Vec<String> = within
                .iter()
                .filter(|name| !closure.contains(*name))
                .filter(|name| {
                    self.descriptor(name)
                        .is_some_and(|d| d.depends_on.iter().any(|dep| closure.contains(dep)))
                })
                .cloned()
                .collect();
            if grown.is_empty() {
                return closure;
            }
            closure.extend(grown);
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<&EngineDescriptor> {
        self.index.get(name).map(|&idx| &self.descriptors[idx])
    }

    pub fn engine(&self, name: &str) -> Option<Arc<dyn Engine>> {
        self.index.get(name).map(|&idx| Arc::clone(&self.engines[idx]))
    }

    /// Position in registration order; used to break ties deterministically.
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &EngineDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// `:` separates the engine name from the digest in cache keys.
fn check_name(name: &str) -> Result<(), ConfigurationError> {
    if name.contains(':') {
        return Err(ConfigurationError::InvalidEngineName(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engines::mock::MockEngine;
    use serde_json::json;

    fn stub(name: &str) -> Arc<dyn Engine> {
        Arc::new(MockEngine::returning(name, json!({})))
    }

    fn entry(descriptor: EngineDescriptor) -> (EngineDescriptor, Arc<dyn Engine>) {
        let engine = stub(&descriptor.name);
        (descriptor, engine)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn travel_registry() -> EngineRegistry {
        let mut registry = EngineRegistry::new();
        registry
            .register_all(vec![
                entry(EngineDescriptor::new("itinerary").depends_on(["profile", "budget"])),
                entry(EngineDescriptor::new("nlp")),
                entry(EngineDescriptor::new("profile").depends_on(["nlp"])),
                entry(EngineDescriptor::new("budget").depends_on(["nlp"])),
                entry(EngineDescriptor::new("weather")),
            ])
            .expect("valid batch");
        registry
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = EngineRegistry::new();
        registry.register(EngineDescriptor::new("nlp"), stub("nlp")).unwrap();
        assert!(matches!(
            registry.register(EngineDescriptor::new("nlp"), stub("nlp")),
            Err(ConfigurationError::DuplicateEngine(name)) if name == "nlp"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn names_with_the_key_separator_are_rejected() {
        let mut registry = EngineRegistry::new();
        assert!(matches!(
            registry.register(EngineDescriptor::new("nlp:v2"), stub("nlp:v2")),
            Err(ConfigurationError::InvalidEngineName(name)) if name == "nlp:v2"
        ));
        assert!(matches!(
            registry.register_all(vec![
                entry(EngineDescriptor::new("nlp")),
                entry(EngineDescriptor::new("nlp:b")),
            ]),
            Err(ConfigurationError::InvalidEngineName(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut registry = EngineRegistry::new();
        assert!(matches!(
            registry.register(EngineDescriptor::new("budget").depends_on(["nlp"]), stub("budget")),
            Err(ConfigurationError::InvalidDependency { engine, dependency })
                if engine == "budget" && dependency == "nlp"
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut registry = EngineRegistry::new();
        assert!(matches!(
            registry.register(EngineDescriptor::new("loop").depends_on(["loop"]), stub("loop")),
            Err(ConfigurationError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn cyclic_batch_registers_nothing() {
        let mut registry = EngineRegistry::new();
        registry.register(EngineDescriptor::new("nlp"), stub("nlp")).unwrap();

        let result = registry.register_all(vec![
            entry(EngineDescriptor::new("a").depends_on(["b", "nlp"])),
            entry(EngineDescriptor::new("b").depends_on(["a"])),
            entry(EngineDescriptor::new("c")),
        ]);

        assert!(matches!(result, Err(ConfigurationError::CyclicDependency { .. })));
        assert_eq!(registry.len(), 1);
        assert!(registry.descriptor("c").is_none());
    }

    #[test]
    fn batch_accepts_any_order_and_keeps_declaration_order() {
        let registry = travel_registry();
        assert_eq!(registry.declaration_index("itinerary"), Some(0));
        assert_eq!(registry.declaration_index("budget"), Some(3));
        assert!(registry.engine("weather").is_some());
    }

    #[test]
    fn resolve_returns_transitive_closure() {
        let registry = travel_registry();
        assert_eq!(
            registry.resolve(&["itinerary"]).unwrap(),
            set(&["budget", "itinerary", "nlp", "profile"])
        );
        assert_eq!(registry.resolve(&["budget", "weather"]).unwrap(), set(&["budget", "nlp", "weather"]));
    }

    #[test]
    fn resolve_unknown_goal_fails() {
        assert!(matches!(
            travel_registry().resolve(&["flights"]),
            Err(ConfigurationError::UnknownGoal(name)) if name == "flights"
        ));
    }

    #[test]
    fn dependents_closure_stays_within_scope() {
        let registry = travel_registry();
        let within = set(&["nlp", "profile", "budget", "itinerary"]);
        assert_eq!(
            registry.dependents_closure(&set(&["budget"]), &within),
            set(&["budget", "itinerary"])
        );
        assert_eq!(registry.dependents_closure(&set(&["nlp"]), &within), within);
        assert_eq!(
            registry.dependents_closure(&set(&["budget"]), &set(&["budget", "nlp"])),
            set(&["budget"])
        );
    }
}
