use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::context::RenderProbe;
use crate::relation::Value;

/// Parameter tokens recognized in query templates.
pub const PARAM_ENVIRONMENT: &str = "environment";
pub const PARAM_ANCHOR_DATE: &str = "anchor_date";
pub const PARAM_WATERMARK: &str = "watermark";

fn param_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([a-z_]+)").expect("valid parameter pattern"))
}

/// A query body with `@`-parameters standing in for context-dependent
/// fragments. Substitution is the entire templating surface: no loops, no
/// conditionals, no includes — branch structure belongs to the render
/// function, not the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    raw: String,
}

impl QueryTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// All `@name` tokens appearing in the template, recognized or not.
    pub fn parameters(&self) -> BTreeSet<String> {
        param_pattern()
            .captures_iter(&self.raw)
            .map(|c| c[1].to_string())
            .collect()
    }

    pub fn uses(&self, param: &str) -> bool {
        self.parameters().contains(param)
    }

    /// Substitute recognized parameters from the probe. Context accessors
    /// are only touched for parameters actually present, so read tracking
    /// reflects the template's real appetite. Unrecognized tokens pass
    /// through untouched for the validator to flag.
    pub fn substitute(&self, probe: &RenderProbe) -> String {
        param_pattern()
            .replace_all(&self.raw, |caps: &regex::Captures| match &caps[1] {
                PARAM_ENVIRONMENT => probe.environment_name().to_string(),
                PARAM_ANCHOR_DATE => Value::Date(probe.anchor_date()).sql_literal(),
                PARAM_WATERMARK => probe
                    .watermark()
                    .map(|v| v.sql_literal())
                    .unwrap_or_else(|| "NULL".to_string()),
                _ => caps[0].to_string(),
            })
            .into_owned()
    }
}
