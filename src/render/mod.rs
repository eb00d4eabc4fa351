pub mod template;

pub use template::QueryTemplate;

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::context::{Context, ContextVar, RenderProbe};
use crate::error::{CtxDriftError, Result};
use crate::registry::Unit;
use crate::relation::Value;

/// Concrete query text ready to dispatch to the target store. Opaque to the
/// engine: never parsed, only compared and fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryText(String);

impl QueryText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// SHA-256 hex fingerprint of the text, recorded in build reports.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for QueryText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of one render call: the text plus what the render function
/// actually consulted while producing it.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub text: QueryText,
    pub reads: BTreeSet<ContextVar>,
    /// Context variables read but not declared by the unit.
    pub leaked: Vec<ContextVar>,
}

impl Rendered {
    pub fn has_leak(&self) -> bool {
        !self.leaked.is_empty()
    }
}

/// Renders a unit against a context and enforces the reproducibility
/// invariant: two calls with equal inputs must yield byte-identical text.
pub struct Renderer;

impl Renderer {
    pub fn render(unit: &Unit, ctx: &Context, watermark: Option<&Value>) -> Result<Rendered> {
        let first = RenderProbe::new(ctx, watermark);
        let text_a = (unit.render)(&first);

        let second = RenderProbe::new(ctx, watermark);
        let text_b = (unit.render)(&second);

        if text_a != text_b {
            return Err(CtxDriftError::RenderNondeterminism(unit.name.clone()));
        }

        let mut reads = first.reads();
        reads.extend(second.reads());
        let leaked: Vec<ContextVar> = reads
            .iter()
            .filter(|v| !unit.declared_reads.contains(v))
            .copied()
            .collect();

        Ok(Rendered {
            text: QueryText::new(text_a),
            reads,
            leaked,
        })
    }

    /// Like `render`, but an undeclared context read is an error instead of
    /// an annotation. Used by validation surfaces; the build itself keeps
    /// going on a leak and lets the classifier downgrade the unit.
    pub fn render_strict(unit: &Unit, ctx: &Context, watermark: Option<&Value>) -> Result<Rendered> {
        let rendered = Self::render(unit, ctx, watermark)?;
        if rendered.has_leak() {
            return Err(CtxDriftError::ContextLeak {
                unit: unit.name.clone(),
                variables: rendered
                    .leaked
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(rendered)
    }
}
