use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;

use crate::relation::Value;

/// The context variables a render function may consult. Units declare the
/// subset they read; reading anything outside that set is a context leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextVar {
    EnvironmentName,
    CurrentAnchorDate,
    HasPriorOutput,
}

impl ContextVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextVar::EnvironmentName => "environment_name",
            ContextVar::CurrentAnchorDate => "current_anchor_date",
            ContextVar::HasPriorOutput => "has_prior_output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "environment_name" => Some(ContextVar::EnvironmentName),
            "current_anchor_date" => Some(ContextVar::CurrentAnchorDate),
            "has_prior_output" => Some(ContextVar::HasPriorOutput),
            _ => None,
        }
    }
}

impl fmt::Display for ContextVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build invocation's coordinates. Constructed once per build, immutable
/// thereafter; every render and materialize call in that build sees the same
/// frozen values. `anchor_date` is "now" as frozen at build start — never
/// wall-clock-sampled mid-build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub environment_name: String,
    pub anchor_date: NaiveDate,
    /// Whether the target relation for the unit being rendered already
    /// exists. The materializer fixes this per unit via `with_prior_output`.
    pub has_prior_output: bool,
}

impl Context {
    pub fn new(environment_name: impl Into<String>, anchor_date: NaiveDate) -> Self {
        Self {
            environment_name: environment_name.into(),
            anchor_date,
            has_prior_output: false,
        }
    }

    pub fn with_prior_output(&self, has_prior_output: bool) -> Self {
        Self {
            has_prior_output,
            ..self.clone()
        }
    }
}

/// Read-recording view of a Context handed to render functions.
///
/// Every accessor records which context variable was consulted, so the
/// renderer can compare actual reads against the unit's declared set and the
/// classifier can probe differentially.
pub struct RenderProbe<'a> {
    ctx: &'a Context,
    watermark: Option<&'a Value>,
    reads: RefCell<BTreeSet<ContextVar>>,
}

impl<'a> RenderProbe<'a> {
    pub fn new(ctx: &'a Context, watermark: Option<&'a Value>) -> Self {
        Self {
            ctx,
            watermark,
            reads: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn environment_name(&self) -> &str {
        self.reads.borrow_mut().insert(ContextVar::EnvironmentName);
        &self.ctx.environment_name
    }

    pub fn anchor_date(&self) -> NaiveDate {
        self.reads.borrow_mut().insert(ContextVar::CurrentAnchorDate);
        self.ctx.anchor_date
    }

    pub fn has_prior_output(&self) -> bool {
        self.reads.borrow_mut().insert(ContextVar::HasPriorOutput);
        self.ctx.has_prior_output
    }

    /// The last persisted max of the unit's leading key column, if any.
    /// Unit-local state rather than build context, so not tracked as a read.
    pub fn watermark(&self) -> Option<&Value> {
        self.watermark
    }

    pub fn reads(&self) -> BTreeSet<ContextVar> {
        self.reads.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> NaiveDate {
        NaiveDate::from_ymd_opt(1998, 8, 2).unwrap()
    }

    #[test]
    fn test_probe_records_reads() {
        let ctx = Context::new("dev", anchor());
        let probe = RenderProbe::new(&ctx, None);

        assert!(probe.reads().is_empty());
        let _ = probe.environment_name();
        let _ = probe.anchor_date();

        let reads = probe.reads();
        assert!(reads.contains(&ContextVar::EnvironmentName));
        assert!(reads.contains(&ContextVar::CurrentAnchorDate));
        assert!(!reads.contains(&ContextVar::HasPriorOutput));
    }

    #[test]
    fn test_watermark_access_is_not_a_context_read() {
        let ctx = Context::new("dev", anchor());
        let wm = Value::Date(anchor());
        let probe = RenderProbe::new(&ctx, Some(&wm));

        assert_eq!(probe.watermark(), Some(&wm));
        assert!(probe.reads().is_empty());
    }

    #[test]
    fn test_with_prior_output_preserves_coordinates() {
        let ctx = Context::new("prod", anchor());
        let next = ctx.with_prior_output(true);

        assert_eq!(next.environment_name, "prod");
        assert_eq!(next.anchor_date, anchor());
        assert!(next.has_prior_output);
        assert!(!ctx.has_prior_output);
    }

    #[test]
    fn test_context_var_parse_roundtrip() {
        for var in [
            ContextVar::EnvironmentName,
            ContextVar::CurrentAnchorDate,
            ContextVar::HasPriorOutput,
        ] {
            assert_eq!(ContextVar::parse(var.as_str()), Some(var));
        }
        assert_eq!(ContextVar::parse("wall_clock"), None);
    }
}
