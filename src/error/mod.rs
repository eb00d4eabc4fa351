use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtxDriftError {
    #[error("duplicate unit: {0}")]
    DuplicateUnit(String),

    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("cyclic dependency: {0}")]
    CyclicDependency(String),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("invalid unit '{unit}': {reason}")]
    InvalidUnit { unit: String, reason: String },

    #[error("render for unit '{0}' produced different text for equal inputs")]
    RenderNondeterminism(String),

    #[error("unit '{unit}' read undeclared context variable(s): {variables}")]
    ContextLeak { unit: String, variables: String },

    #[error("materialization of unit '{unit}' failed: {reason}")]
    Materialization { unit: String, reason: String },

    #[error("relation '{0}' left in neither pre- nor post-merge state; manual reconciliation required")]
    PartialMerge(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("declaration parse error: {0}")]
    DslParse(String),

    #[error("SQL file not found: {0}")]
    SqlFileNotFound(String),

    #[error("relation not found in target store: {0}")]
    RelationNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CtxDriftError>;
