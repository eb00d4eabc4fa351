use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::context::{ContextVar, RenderProbe};
use crate::error::{CtxDriftError, Result};

/// How a unit's output is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    View,
    Table,
    Incremental,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Materialization::View => "view",
            Materialization::Table => "table",
            Materialization::Incremental => "incremental",
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure function from build context to query text. Referential transparency
/// in everything except the declared context reads is a contract on the
/// caller side; the renderer verifies it by double-rendering.
pub type RenderFn = Arc<dyn Fn(&RenderProbe) -> String + Send + Sync>;

/// One named transformation in the catalog.
#[derive(Clone)]
pub struct Unit {
    pub name: String,
    pub dependencies: BTreeSet<String>,
    pub materialization: Materialization,
    /// Required iff `incremental`; the leading column carries the watermark.
    pub unique_key: Vec<String>,
    pub declared_reads: BTreeSet<ContextVar>,
    pub render: RenderFn,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub tags: Vec<String>,
}

impl Unit {
    pub fn new(
        name: impl Into<String>,
        materialization: Materialization,
        render: RenderFn,
    ) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            materialization,
            unique_key: Vec::new(),
            declared_reads: BTreeSet::new(),
            render,
            description: None,
            owner: None,
            tags: Vec::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unique_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_declared_reads<I>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = ContextVar>,
    {
        self.declared_reads = reads.into_iter().collect();
        self
    }

    fn validate(&self) -> Result<()> {
        match self.materialization {
            Materialization::Incremental if self.unique_key.is_empty() => {
                Err(CtxDriftError::InvalidUnit {
                    unit: self.name.clone(),
                    reason: "incremental units require a unique_key".to_string(),
                })
            }
            Materialization::View | Materialization::Table if !self.unique_key.is_empty() => {
                Err(CtxDriftError::InvalidUnit {
                    unit: self.name.clone(),
                    reason: format!(
                        "unique_key is only valid for incremental units, not {}",
                        self.materialization
                    ),
                })
            }
            _ if self.dependencies.contains(&self.name) => Err(CtxDriftError::InvalidUnit {
                unit: self.name.clone(),
                reason: "unit depends on itself".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("materialization", &self.materialization)
            .field("unique_key", &self.unique_key)
            .field("declared_reads", &self.declared_reads)
            .finish_non_exhaustive()
    }
}

/// Holds the catalog of units and their `ref`-style edges, enforcing a
/// single DAG. Adjacency in both directions is built at registration time.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: BTreeMap<String, Arc<Unit>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict single-phase registration: every dependency must already be
    /// registered, so no cycle can ever form through this path.
    pub fn register(&mut self, unit: Unit) -> Result<()> {
        unit.validate()?;
        if self.units.contains_key(&unit.name) {
            return Err(CtxDriftError::DuplicateUnit(unit.name));
        }
        for dep in &unit.dependencies {
            if !self.units.contains_key(dep) {
                return Err(CtxDriftError::UnknownDependency {
                    unit: unit.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        self.insert(unit);
        Ok(())
    }

    /// Two-phase registration: declare all names first, then validate edges
    /// and acyclicity. Declaration order does not matter.
    pub fn register_all(&mut self, units: Vec<Unit>) -> Result<()> {
        for unit in &units {
            unit.validate()?;
            if self.units.contains_key(&unit.name)
                || units.iter().filter(|u| u.name == unit.name).count() > 1
            {
                return Err(CtxDriftError::DuplicateUnit(unit.name.clone()));
            }
        }
        let names: BTreeSet<String> = self
            .units
            .keys()
            .cloned()
            .chain(units.iter().map(|u| u.name.clone()))
            .collect();
        for unit in &units {
            for dep in &unit.dependencies {
                if !names.contains(dep) {
                    return Err(CtxDriftError::UnknownDependency {
                        unit: unit.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        let added: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
        for unit in units {
            self.insert(unit);
        }
        // Validate acyclicity over the whole graph, naming any cycle found.
        // A failed batch leaves the registry as it was before the call.
        if let Err(e) = self.resolve_order() {
            for name in &added {
                self.remove(name);
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove(&mut self, name: &str) {
        if let Some(unit) = self.units.remove(name) {
            for dep in &unit.dependencies {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(name);
                }
            }
            self.dependents.remove(name);
        }
    }

    fn insert(&mut self, unit: Unit) {
        for dep in &unit.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(unit.name.clone());
        }
        self.dependents.entry(unit.name.clone()).or_default();
        self.units.insert(unit.name.clone(), Arc::new(unit));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Unit>> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| CtxDriftError::UnitNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.units.values()
    }

    pub fn dependencies_of(&self, name: &str) -> Result<&BTreeSet<String>> {
        self.units
            .get(name)
            .map(|u| &u.dependencies)
            .ok_or_else(|| CtxDriftError::UnitNotFound(name.to_string()))
    }

    pub fn dependents_of(&self, name: &str) -> Result<&BTreeSet<String>> {
        if !self.units.contains_key(name) {
            return Err(CtxDriftError::UnitNotFound(name.to_string()));
        }
        Ok(self.dependents.get(name).expect("adjacency kept in sync"))
    }

    /// Deterministic topological ordering, ties broken by unit name
    /// ascending. Fails with the offending cycle if the graph is not a DAG.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> = self
            .units
            .iter()
            .map(|(name, unit)| (name.as_str(), unit.dependencies.len()))
            .collect();

        // BTreeSet keeps the ready set name-ordered, which makes the
        // ordering reproducible across runs.
        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(self.units.len());
        while let Some(name) = ready.iter().next().copied() {
            ready.remove(name);
            order.push(name.to_string());
            if let Some(deps) = self.dependents.get(name) {
                for dependent in deps {
                    let d = indegree
                        .get_mut(dependent.as_str())
                        .expect("dependent is registered");
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if order.len() != self.units.len() {
            let remaining: BTreeSet<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .collect();
            return Err(CtxDriftError::CyclicDependency(self.find_cycle(&remaining)));
        }
        Ok(order)
    }

    /// Walks dependency edges within the unresolved remainder until a node
    /// repeats, and formats the loop for the error message.
    fn find_cycle(&self, remaining: &BTreeSet<&str>) -> String {
        let start = match remaining.iter().next() {
            Some(s) => *s,
            None => return "unknown".to_string(),
        };
        let mut path: Vec<&str> = vec![start];
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        seen.insert(start);
        let mut current = start;
        loop {
            let next = self.units[current]
                .dependencies
                .iter()
                .map(|d| d.as_str())
                .find(|d| remaining.contains(d));
            let next = match next {
                Some(n) => n,
                None => return path.join(" -> "),
            };
            if seen.contains(next) {
                let pos = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<&str> = path[pos..].to_vec();
                cycle.push(next);
                return cycle.join(" -> ");
            }
            seen.insert(next);
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unit(name: &str, deps: &[&str]) -> Unit {
        Unit::new(name, Materialization::View, Arc::new(|_| "SELECT 1".to_string()))
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_register_duplicate_fails() {
        let mut reg = UnitRegistry::new();
        reg.register(unit("a", &[])).unwrap();
        let err = reg.register(unit("a", &[])).unwrap_err();
        assert!(matches!(err, CtxDriftError::DuplicateUnit(n) if n == "a"));
    }

    #[test]
    fn test_register_unknown_dependency_fails() {
        let mut reg = UnitRegistry::new();
        let err = reg.register(unit("a", &["b"])).unwrap_err();
        assert!(matches!(
            err,
            CtxDriftError::UnknownDependency { unit, dependency }
                if unit == "a" && dependency == "b"
        ));
    }

    #[test]
    fn test_register_all_detects_cycle() {
        let mut reg = UnitRegistry::new();
        let err = reg
            .register_all(vec![unit("a", &["b"]), unit("b", &["c"]), unit("c", &["a"])])
            .unwrap_err();
        match err {
            CtxDriftError::CyclicDependency(cycle) => {
                assert!(cycle.contains("a"));
                assert!(cycle.contains("b"));
                assert!(cycle.contains("c"));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_register_all_unordered_declarations() {
        let mut reg = UnitRegistry::new();
        reg.register_all(vec![unit("downstream", &["upstream"]), unit("upstream", &[])])
            .unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_resolve_order_ties_broken_by_name() {
        let mut reg = UnitRegistry::new();
        reg.register_all(vec![
            unit("zeta", &[]),
            unit("alpha", &[]),
            unit("mid", &["alpha", "zeta"]),
        ])
        .unwrap();
        assert_eq!(reg.resolve_order().unwrap(), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_adjacency_lookups() {
        let mut reg = UnitRegistry::new();
        reg.register(unit("src", &[])).unwrap();
        reg.register(unit("mart", &["src"])).unwrap();

        assert!(reg.dependencies_of("mart").unwrap().contains("src"));
        assert!(reg.dependents_of("src").unwrap().contains("mart"));
        assert!(reg.dependents_of("mart").unwrap().is_empty());
        assert!(reg.dependencies_of("missing").is_err());
    }

    #[test]
    fn test_incremental_requires_unique_key() {
        let mut reg = UnitRegistry::new();
        let u = Unit::new("inc", Materialization::Incremental, Arc::new(|_| String::new()));
        let err = reg.register(u).unwrap_err();
        assert!(matches!(err, CtxDriftError::InvalidUnit { .. }));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut reg = UnitRegistry::new();
        let err = reg.register(unit("a", &["a"])).unwrap_err();
        assert!(matches!(err, CtxDriftError::InvalidUnit { .. }));
    }
}
