use super::parser::UnitDef;
use crate::context::ContextVar;
use crate::registry::Materialization;
use crate::render::template::{PARAM_ANCHOR_DATE, PARAM_ENVIRONMENT, PARAM_WATERMARK};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub unit_name: String,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub code: &'static str,
    pub message: String,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

pub struct UnitValidator;

impl UnitValidator {
    pub fn validate(def: &UnitDef) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        Self::check_unique_key(def, &mut errors);
        Self::check_delta_placement(def, &mut errors);
        Self::check_undeclared_parameters(def, &mut errors);
        Self::check_unknown_parameters(def, &mut errors);
        Self::check_unused_reads(def, &mut warnings);
        Self::check_delta_anchor_bound(def, &mut warnings);
        Self::check_missing_delta(def, &mut warnings);

        ValidationResult {
            unit_name: def.name.clone(),
            errors,
            warnings,
        }
    }

    fn check_unique_key(def: &UnitDef, errors: &mut Vec<ValidationError>) {
        match def.materialization {
            Materialization::Incremental if def.unique_key.is_empty() => {
                errors.push(ValidationError {
                    code: "E001",
                    message: "incremental units require a unique_key".to_string(),
                });
            }
            Materialization::View | Materialization::Table if !def.unique_key.is_empty() => {
                errors.push(ValidationError {
                    code: "E002",
                    message: format!(
                        "unique_key is only valid for incremental units, not {}",
                        def.materialization
                    ),
                });
            }
            _ => {}
        }
    }

    fn check_delta_placement(def: &UnitDef, errors: &mut Vec<ValidationError>) {
        if def.delta_sql.is_some() && def.materialization != Materialization::Incremental {
            errors.push(ValidationError {
                code: "E003",
                message: format!(
                    "delta_sql is only valid for incremental units, not {}",
                    def.materialization
                ),
            });
        }
    }

    /// Every context variable a template can pull in must appear in the
    /// declared read set, or the render will be rejected as a leak at build
    /// time. Catch it here, at load time.
    fn check_undeclared_parameters(def: &UnitDef, errors: &mut Vec<ValidationError>) {
        for (param, var) in Self::param_reads() {
            let used = def.sql.uses(param)
                || def.delta_sql.as_ref().is_some_and(|d| d.uses(param));
            if used && !def.declared_reads.contains(&var) {
                errors.push(ValidationError {
                    code: "E004",
                    message: format!(
                        "template uses @{} but '{}' is not in reads",
                        param,
                        var.as_str()
                    ),
                });
            }
        }
        if def.delta_sql.is_some()
            && !def.declared_reads.contains(&ContextVar::HasPriorOutput)
        {
            errors.push(ValidationError {
                code: "E004",
                message: "delta_sql branches on prior output but 'has_prior_output' is not in reads"
                    .to_string(),
            });
        }
    }

    fn check_unknown_parameters(def: &UnitDef, errors: &mut Vec<ValidationError>) {
        let known = [PARAM_ENVIRONMENT, PARAM_ANCHOR_DATE, PARAM_WATERMARK];
        let mut templates = vec![&def.sql];
        if let Some(d) = &def.delta_sql {
            templates.push(d);
        }
        for tpl in templates {
            for param in tpl.parameters() {
                if !known.contains(&param.as_str()) {
                    errors.push(ValidationError {
                        code: "E005",
                        message: format!("unrecognized template parameter @{}", param),
                    });
                }
            }
        }
    }

    fn check_unused_reads(def: &UnitDef, warnings: &mut Vec<ValidationWarning>) {
        for (param, var) in Self::param_reads() {
            let used = def.sql.uses(param)
                || def.delta_sql.as_ref().is_some_and(|d| d.uses(param));
            if def.declared_reads.contains(&var) && !used {
                warnings.push(ValidationWarning {
                    code: "W001",
                    message: format!(
                        "'{}' declared in reads but no template uses @{}",
                        var.as_str(),
                        param
                    ),
                });
            }
        }
        if def.declared_reads.contains(&ContextVar::HasPriorOutput) && def.delta_sql.is_none() {
            warnings.push(ValidationWarning {
                code: "W001",
                message: "'has_prior_output' declared in reads but unit has no delta_sql"
                    .to_string(),
            });
        }
    }

    /// A delta body with no @anchor_date bound floats with whatever data has
    /// arrived at run time, which makes the unit context-sensitive.
    fn check_delta_anchor_bound(def: &UnitDef, warnings: &mut Vec<ValidationWarning>) {
        if let Some(delta) = &def.delta_sql {
            if !delta.uses(PARAM_ANCHOR_DATE) {
                warnings.push(ValidationWarning {
                    code: "W002",
                    message: "delta_sql has no @anchor_date upper bound; its output will \
                              drift with ingestion timing"
                        .to_string(),
                });
            }
        }
    }

    fn check_missing_delta(def: &UnitDef, warnings: &mut Vec<ValidationWarning>) {
        if def.materialization == Materialization::Incremental && def.delta_sql.is_none() {
            warnings.push(ValidationWarning {
                code: "W003",
                message: "incremental unit has no delta_sql; every build re-derives the full body"
                    .to_string(),
            });
        }
    }

    fn param_reads() -> [(&'static str, ContextVar); 2] {
        [
            (PARAM_ENVIRONMENT, ContextVar::EnvironmentName),
            (PARAM_ANCHOR_DATE, ContextVar::CurrentAnchorDate),
        ]
    }
}
