use glob::glob;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::parser::{RawUnitDef, UnitDef};
use crate::error::{CtxDriftError, Result};
use crate::registry::UnitRegistry;
use crate::render::QueryTemplate;

/// Loads unit declarations from a directory tree: one YAML file per unit,
/// SQL bodies in sibling files resolved relative to the YAML's directory.
pub struct UnitLoader;

impl UnitLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load_dir(&self, path: impl AsRef<Path>) -> Result<Vec<UnitDef>> {
        let pattern = path.as_ref().join("**/*.yaml");
        let pattern_str = pattern.to_string_lossy();

        let yaml_files: Vec<PathBuf> = glob(&pattern_str)
            .map_err(|e| CtxDriftError::DslParse(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();

        yaml_files
            .into_iter()
            .map(|yaml_path| self.load_unit(&yaml_path))
            .collect()
    }

    pub fn load_unit(&self, yaml_path: impl AsRef<Path>) -> Result<UnitDef> {
        let yaml_path = yaml_path.as_ref();
        let yaml_content = fs::read_to_string(yaml_path)?;

        let raw: RawUnitDef = serde_yaml::from_str(&yaml_content)?;
        let base_dir = yaml_path.parent().unwrap_or(Path::new("."));

        self.resolve_unit(raw, base_dir)
    }

    /// Load a directory and assemble the registry in one step. Registration
    /// is all-or-nothing: a cycle or unknown dependency leaves nothing
    /// registered.
    pub fn load_registry(&self, path: impl AsRef<Path>) -> Result<UnitRegistry> {
        let defs = self.load_dir(path)?;
        let mut registry = UnitRegistry::new();
        registry.register_all(defs.into_iter().map(UnitDef::into_unit).collect())?;
        Ok(registry)
    }

    fn resolve_unit(&self, raw: RawUnitDef, base_dir: &Path) -> Result<UnitDef> {
        let declared_reads = UnitDef::parse_reads(&raw.reads, &raw.name)?;

        let sql = QueryTemplate::new(Self::read_sql(base_dir, &raw.sql)?);
        let delta_sql = match raw.delta_sql.as_deref() {
            Some(f) => Some(QueryTemplate::new(Self::read_sql(base_dir, f)?)),
            None => None,
        };

        debug!(unit = %raw.name, sql = %raw.sql, "loaded unit declaration");

        Ok(UnitDef {
            name: raw.name,
            materialization: raw.materialization,
            unique_key: raw.unique_key,
            depends_on: raw.depends_on,
            declared_reads,
            sql,
            delta_sql,
            description: raw.description,
            owner: raw.owner,
            tags: raw.tags,
        })
    }

    fn read_sql(base_dir: &Path, filename: &str) -> Result<String> {
        let sql_path = base_dir.join(filename);
        fs::read_to_string(&sql_path)
            .map_err(|_| CtxDriftError::SqlFileNotFound(sql_path.display().to_string()))
    }
}

impl Default for UnitLoader {
    fn default() -> Self {
        Self::new()
    }
}
