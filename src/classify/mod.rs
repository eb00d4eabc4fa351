use chrono::{Duration, NaiveDate};
use colored::Colorize;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::fmt;

use crate::context::{Context, ContextVar};
use crate::error::Result;
use crate::registry::{Materialization, Unit};
use crate::relation::Value;
use crate::render::Renderer;

/// Whether two builds of a unit are comparable: differences between
/// DETERMINISTIC outputs reflect genuine data or logic change; differences
/// between CONTEXT_SENSITIVE outputs may be build artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Deterministic,
    ContextSensitive,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Deterministic => "DETERMINISTIC",
            Verdict::ContextSensitive => "CONTEXT_SENSITIVE",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-unit verdict for one comparison. Computed fresh per diff run, never
/// persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub unit: String,
    pub verdict: Verdict,
    /// The declared context variable responsible, when CONTEXT_SENSITIVE.
    pub cause: Option<ContextVar>,
    /// Context variables the render consulted without declaring.
    pub leaked: Vec<ContextVar>,
    /// Human-readable structural basis for the verdict.
    pub evidence: Option<String>,
}

impl Classification {
    pub fn is_deterministic(&self) -> bool {
        self.verdict == Verdict::Deterministic
    }

    fn deterministic(unit: &Unit) -> Self {
        Self {
            unit: unit.name.clone(),
            verdict: Verdict::Deterministic,
            cause: None,
            leaked: Vec::new(),
            evidence: None,
        }
    }

    fn sensitive(unit: &Unit, cause: ContextVar, evidence: String) -> Self {
        Self {
            unit: unit.name.clone(),
            verdict: Verdict::ContextSensitive,
            cause: Some(cause),
            leaked: Vec::new(),
            evidence: Some(evidence),
        }
    }
}

/// Decides whether a unit's generated query depends on build context beyond
/// persisted source data, by rendering it under controlled context
/// variations and comparing the texts structurally.
///
/// The probes hold everything fixed except one variable at a time:
/// environment name first (anchor fixed), then anchor date (environment
/// fixed), with prior-output state held constant within each probe pair.
pub struct Classifier {
    synthetic_anchor: NaiveDate,
    anchor_step: Duration,
    probe_watermark: Value,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            synthetic_anchor: NaiveDate::from_ymd_opt(1998, 8, 2)
                .expect("valid synthetic anchor"),
            anchor_step: Duration::days(30),
            probe_watermark: Value::Date(
                NaiveDate::from_ymd_opt(1998, 7, 1).expect("valid probe watermark"),
            ),
        }
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify against fully synthetic contexts. Used for catalog-level
    /// reports where no concrete pair of builds is at hand.
    pub fn classify(&self, unit: &Unit) -> Result<Classification> {
        let a = Context::new("ctxprobe_a", self.synthetic_anchor);
        let b = Context::new("ctxprobe_b", self.synthetic_anchor + self.anchor_step);
        self.classify_pair(unit, &a, &b)
    }

    /// Classify a unit for a concrete pair of build contexts. The probe
    /// sets are derived from the pair so that branches keyed on the real
    /// environment names are actually exercised.
    pub fn classify_pair(
        &self,
        unit: &Unit,
        ctx_a: &Context,
        ctx_b: &Context,
    ) -> Result<Classification> {
        let (env_a, env_b) = if ctx_a.environment_name == ctx_b.environment_name {
            (
                ctx_a.environment_name.clone(),
                format!("{}_ctxprobe", ctx_a.environment_name),
            )
        } else {
            (
                ctx_a.environment_name.clone(),
                ctx_b.environment_name.clone(),
            )
        };
        let (anchor_a, anchor_b) = if ctx_a.anchor_date == ctx_b.anchor_date {
            (ctx_a.anchor_date, ctx_a.anchor_date + self.anchor_step)
        } else {
            (ctx_a.anchor_date, ctx_b.anchor_date)
        };

        let mut leaked: Vec<ContextVar> = Vec::new();

        // Probe both branch states for incremental units; views and tables
        // have a single render path.
        let branches: Vec<(bool, Option<&Value>)> = match unit.materialization {
            Materialization::Incremental => {
                vec![(false, None), (true, Some(&self.probe_watermark))]
            }
            _ => vec![(false, None)],
        };

        for (has_prior, watermark) in &branches {
            // Environment variation, anchor held fixed.
            let ra = Renderer::render(
                unit,
                &Context::new(env_a.clone(), anchor_a).with_prior_output(*has_prior),
                *watermark,
            )?;
            let rb = Renderer::render(
                unit,
                &Context::new(env_b.clone(), anchor_a).with_prior_output(*has_prior),
                *watermark,
            )?;
            merge_leaks(&mut leaked, &ra.leaked);
            merge_leaks(&mut leaked, &rb.leaked);

            if ra.text != rb.text {
                // Schema-style embedding of the environment name is
                // expected; anything that survives masking it is a real
                // structural difference.
                let na = mask(ra.text.as_str(), &env_a, "__ENV__");
                let nb = mask(rb.text.as_str(), &env_b, "__ENV__");
                if na != nb {
                    let mut c = Classification::sensitive(
                        unit,
                        ContextVar::EnvironmentName,
                        format!(
                            "rendered text varies with environment_name ({} vs {}):\n{}",
                            env_a,
                            env_b,
                            text_diff(&na, &nb)
                        ),
                    );
                    c.leaked = leaked;
                    return Ok(c);
                }
            }

            // Anchor variation, environment held fixed.
            let r1 = Renderer::render(
                unit,
                &Context::new(env_a.clone(), anchor_a).with_prior_output(*has_prior),
                *watermark,
            )?;
            let r2 = Renderer::render(
                unit,
                &Context::new(env_a.clone(), anchor_b).with_prior_output(*has_prior),
                *watermark,
            )?;
            merge_leaks(&mut leaked, &r2.leaked);

            if r1.text == r2.text {
                if *has_prior {
                    // Delta query ignores the frozen anchor entirely: its
                    // upper bound floats with wall-clock execution time, so
                    // two builds at different real times diverge even on
                    // identical data.
                    let mut c = Classification::sensitive(
                        unit,
                        ContextVar::CurrentAnchorDate,
                        "incremental delta query has no upper bound pinned to the frozen \
                         anchor date"
                            .to_string(),
                    );
                    c.leaked = leaked;
                    return Ok(c);
                }
            } else {
                let n1 = mask(r1.text.as_str(), &anchor_a.to_string(), "__ANCHOR__");
                let n2 = mask(r2.text.as_str(), &anchor_b.to_string(), "__ANCHOR__");
                if n1 != n2 {
                    let mut c = Classification::sensitive(
                        unit,
                        ContextVar::CurrentAnchorDate,
                        format!(
                            "rendered structure varies with anchor_date beyond the \
                             embedded bound:\n{}",
                            text_diff(&n1, &n2)
                        ),
                    );
                    c.leaked = leaked;
                    return Ok(c);
                }
                // Texts differ only in the anchor literal: adjacent,
                // non-overlapping extensions of the same history.
            }
        }

        if !leaked.is_empty() {
            // Under-declared context reads void the unit's purity contract;
            // force the pessimistic verdict even if the probes saw no
            // structural variation.
            let cause = leaked[0];
            let mut c = Classification::sensitive(
                unit,
                cause,
                format!(
                    "render consulted undeclared context variable(s): {}",
                    leaked
                        .iter()
                        .map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
            c.leaked = leaked;
            return Ok(c);
        }

        Ok(Classification::deterministic(unit))
    }
}

fn merge_leaks(into: &mut Vec<ContextVar>, leaks: &[ContextVar]) {
    for leak in leaks {
        if !into.contains(leak) {
            into.push(*leak);
        }
    }
}

fn mask(text: &str, needle: &str, placeholder: &str) -> String {
    if needle.is_empty() {
        return text.to_string();
    }
    text.replace(needle, placeholder)
}

/// Plain unified-style line diff used as classification evidence.
fn text_diff(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "- ",
            ChangeTag::Insert => "+ ",
            ChangeTag::Equal => "  ",
        };
        out.push_str(sign);
        out.push_str(change.to_string().trim_end());
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Colorized render diff for terminal output.
pub fn format_render_diff(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let line = change.to_string();
        let formatted = match change.tag() {
            ChangeTag::Delete => format!("- {}", line.trim_end()).red().to_string(),
            ChangeTag::Insert => format!("+ {}", line.trim_end()).green().to_string(),
            ChangeTag::Equal => format!("  {}", line.trim_end()),
        };
        out.push_str(&formatted);
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RenderProbe;
    use std::sync::Arc;

    fn anchor() -> NaiveDate {
        NaiveDate::from_ymd_opt(1998, 8, 2).unwrap()
    }

    #[test]
    fn test_env_ignoring_date_windowed_unit_is_deterministic() {
        let unit = Unit::new(
            "revenue",
            Materialization::Table,
            Arc::new(|p: &RenderProbe| {
                format!(
                    "SELECT * FROM orders WHERE order_date <= DATE '{}'",
                    p.anchor_date()
                )
            }),
        )
        .with_declared_reads([ContextVar::CurrentAnchorDate]);

        let c = Classifier::new().classify(&unit).unwrap();
        assert_eq!(c.verdict, Verdict::Deterministic);
        assert!(c.cause.is_none());
    }

    #[test]
    fn test_environment_branching_lookback_is_context_sensitive() {
        let unit = Unit::new(
            "efficiency",
            Materialization::Table,
            Arc::new(|p: &RenderProbe| {
                let days = if p.environment_name() == "dev" { 90 } else { 365 };
                format!(
                    "SELECT * FROM orders WHERE order_date > DATE '{}' - INTERVAL '{} days'",
                    p.anchor_date(),
                    days
                )
            }),
        )
        .with_declared_reads([ContextVar::EnvironmentName, ContextVar::CurrentAnchorDate]);

        let dev = Context::new("dev", anchor());
        let prod = Context::new("prod", anchor());
        let c = Classifier::new().classify_pair(&unit, &dev, &prod).unwrap();
        assert_eq!(c.verdict, Verdict::ContextSensitive);
        assert_eq!(c.cause, Some(ContextVar::EnvironmentName));
        assert!(c.evidence.unwrap().contains("environment_name"));
    }

    #[test]
    fn test_schema_prefix_embedding_alone_is_not_sensitive() {
        let unit = Unit::new(
            "summary",
            Materialization::View,
            Arc::new(|p: &RenderProbe| {
                format!("SELECT * FROM {}.orders", p.environment_name())
            }),
        )
        .with_declared_reads([ContextVar::EnvironmentName]);

        let dev = Context::new("dev", anchor());
        let prod = Context::new("prod", anchor());
        let c = Classifier::new().classify_pair(&unit, &dev, &prod).unwrap();
        assert_eq!(c.verdict, Verdict::Deterministic);
    }

    #[test]
    fn test_unbounded_delta_is_context_sensitive() {
        let unit = Unit::new(
            "shipments",
            Materialization::Incremental,
            Arc::new(|p: &RenderProbe| {
                if p.has_prior_output() {
                    let wm = p.watermark().map(|v| v.sql_literal()).unwrap_or_default();
                    // No anchor upper bound: floats with wall-clock time.
                    format!("SELECT * FROM shipments WHERE ship_date > {}", wm)
                } else {
                    format!(
                        "SELECT * FROM shipments WHERE ship_date <= DATE '{}'",
                        p.anchor_date()
                    )
                }
            }),
        )
        .with_unique_key(["ship_date"])
        .with_declared_reads([
            ContextVar::HasPriorOutput,
            ContextVar::CurrentAnchorDate,
        ]);

        let c = Classifier::new().classify(&unit).unwrap();
        assert_eq!(c.verdict, Verdict::ContextSensitive);
        assert_eq!(c.cause, Some(ContextVar::CurrentAnchorDate));
    }

    #[test]
    fn test_anchor_bounded_delta_is_deterministic() {
        let unit = Unit::new(
            "daily_orders",
            Materialization::Incremental,
            Arc::new(|p: &RenderProbe| {
                if p.has_prior_output() {
                    let wm = p.watermark().map(|v| v.sql_literal()).unwrap_or_default();
                    format!(
                        "SELECT * FROM orders WHERE order_date > {} AND order_date <= DATE '{}'",
                        wm,
                        p.anchor_date()
                    )
                } else {
                    format!(
                        "SELECT * FROM orders WHERE order_date <= DATE '{}'",
                        p.anchor_date()
                    )
                }
            }),
        )
        .with_unique_key(["order_date"])
        .with_declared_reads([
            ContextVar::HasPriorOutput,
            ContextVar::CurrentAnchorDate,
        ]);

        let c = Classifier::new().classify(&unit).unwrap();
        assert_eq!(c.verdict, Verdict::Deterministic);
    }

    #[test]
    fn test_context_leak_forces_sensitive() {
        let unit = Unit::new(
            "leaky",
            Materialization::Table,
            // Reads the environment without declaring it, and embeds it in
            // a way masking would hide.
            Arc::new(|p: &RenderProbe| format!("SELECT * FROM {}.orders", p.environment_name())),
        );

        let c = Classifier::new().classify(&unit).unwrap();
        assert_eq!(c.verdict, Verdict::ContextSensitive);
        assert_eq!(c.cause, Some(ContextVar::EnvironmentName));
        assert_eq!(c.leaked, vec![ContextVar::EnvironmentName]);
    }

    #[test]
    fn test_nondeterministic_render_propagates_error() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let unit = Unit::new(
            "flaky",
            Materialization::Table,
            Arc::new(move |_: &RenderProbe| {
                format!("SELECT {}", c.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
            }),
        );

        assert!(Classifier::new().classify(&unit).is_err());
    }
}
