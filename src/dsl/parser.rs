use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::{ContextVar, RenderProbe};
use crate::error::{CtxDriftError, Result};
use crate::registry::{Materialization, Unit};
use crate::render::QueryTemplate;

/// Shape of a unit declaration file as written on disk. SQL bodies live in
/// sibling files referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUnitDef {
    pub name: String,
    pub materialization: Materialization,
    #[serde(default)]
    pub unique_key: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Context variables the templates are allowed to consume.
    #[serde(default)]
    pub reads: Vec<String>,
    pub sql: String,
    /// Incremental units may carry a second body rendered when prior output
    /// exists; it reads @watermark to bound the delta from below.
    #[serde(default)]
    pub delta_sql: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A declaration with its SQL bodies loaded and its read set parsed.
#[derive(Debug, Clone)]
pub struct UnitDef {
    pub name: String,
    pub materialization: Materialization,
    pub unique_key: Vec<String>,
    pub depends_on: Vec<String>,
    pub declared_reads: BTreeSet<ContextVar>,
    pub sql: QueryTemplate,
    pub delta_sql: Option<QueryTemplate>,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub tags: Vec<String>,
}

impl UnitDef {
    pub fn parse_reads(names: &[String], unit: &str) -> Result<BTreeSet<ContextVar>> {
        names
            .iter()
            .map(|n| {
                ContextVar::parse(n).ok_or_else(|| CtxDriftError::DslParse(format!(
                    "unit '{}': unknown context variable '{}' in reads",
                    unit, n
                )))
            })
            .collect()
    }

    /// Build the executable unit. The render function selects the delta body
    /// when prior output exists; the branch itself counts as a
    /// has_prior_output read, exactly like a hand-written render would.
    pub fn into_unit(self) -> Unit {
        let full = self.sql.clone();
        let delta = self.delta_sql.clone();

        let render: crate::registry::RenderFn = Arc::new(move |probe: &RenderProbe| match &delta {
            Some(d) if probe.has_prior_output() => d.substitute(probe),
            _ => full.substitute(probe),
        });

        let mut unit = Unit::new(self.name, self.materialization, render)
            .with_dependencies(self.depends_on)
            .with_declared_reads(self.declared_reads);
        if !self.unique_key.is_empty() {
            unit = unit.with_unique_key(self.unique_key);
        }
        unit.description = self.description;
        unit.owner = self.owner;
        unit.tags = self.tags;
        unit
    }
}
