use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ctxdrift::{
    format_render_diff, BuildRunner, Classifier, Context, DiffRunner, MemoryStore, Renderer,
    TargetStore, UnitLoader, UnitRegistry, UnitValidator, Verdict,
};

#[derive(Parser)]
#[command(name = "ctxdrift")]
#[command(about = "SQL transformation builds with context-drift attribution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to unit declarations directory
    #[arg(short, long, default_value = "./units")]
    units: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate all unit declarations
    Validate,

    /// List all units
    List {
        /// Show dependencies, reads and ownership
        #[arg(short, long)]
        detailed: bool,
    },

    /// Render a unit's query for a context and show it
    Show {
        /// Unit name
        unit: String,

        /// Environment name
        #[arg(short, long, default_value = "dev")]
        environment: String,

        /// Anchor date (YYYY-MM-DD). Defaults to today.
        #[arg(short, long)]
        anchor: Option<String>,

        /// Render the prior-output branch of an incremental unit
        #[arg(long)]
        prior: bool,
    },

    /// Build units against an in-process target store
    Build {
        /// Environment name
        #[arg(short, long, default_value = "dev")]
        environment: String,

        /// Anchor date (YYYY-MM-DD). Defaults to today.
        #[arg(short, long)]
        anchor: Option<String>,

        /// Unit to build, with its dependencies (repeatable; all if omitted)
        #[arg(short = 'u', long = "unit")]
        units: Vec<String>,

        /// Maximum concurrent unit executions
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,

        /// Render and fingerprint without executing
        #[arg(long)]
        dry_run: bool,
    },

    /// Classify every unit as DETERMINISTIC or CONTEXT_SENSITIVE
    Classify {
        /// Classify a single unit
        #[arg(short = 'u', long = "unit")]
        unit: Option<String>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Build one unit under two contexts and attribute the differences
    Diff {
        /// Unit name
        unit: String,

        /// First environment
        #[arg(long, default_value = "dev")]
        env_a: String,

        /// Second environment
        #[arg(long, default_value = "prod")]
        env_b: String,

        /// Anchor date for the first build (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        anchor_a: Option<String>,

        /// Anchor date for the second build (YYYY-MM-DD). Defaults to anchor_a.
        #[arg(long)]
        anchor_b: Option<String>,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct UnitRow {
    name: String,
    materialization: String,
    depends_on: String,
    reads: String,
}

#[derive(Tabled)]
struct OutcomeRow {
    unit: String,
    state: String,
    rows: u64,
    elapsed_ms: u64,
    fingerprint: String,
}

#[derive(Tabled)]
struct ClassifyRow {
    unit: String,
    materialization: String,
    verdict: String,
    cause: String,
    leaked: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("ctxdrift=debug,info")
    } else {
        EnvFilter::new("ctxdrift=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31m✗ Error:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let loader = UnitLoader::new();

    match cli.command {
        Commands::Validate => cmd_validate(&loader, &cli.units),

        Commands::List { detailed } => cmd_list(&loader, &cli.units, detailed),

        Commands::Show {
            unit,
            environment,
            anchor,
            prior,
        } => {
            let registry = loader.load_registry(&cli.units)?;
            cmd_show(&registry, &unit, &environment, parse_anchor(anchor)?, prior)
        }

        Commands::Build {
            environment,
            anchor,
            units,
            jobs,
            dry_run,
        } => {
            let registry = Arc::new(loader.load_registry(&cli.units)?);
            let ctx = Context::new(environment, parse_anchor(anchor)?);
            let selected = if units.is_empty() { None } else { Some(units) };
            if dry_run {
                cmd_dry_run(&registry, &ctx, selected.as_deref())
            } else {
                cmd_build(registry, &ctx, selected.as_deref(), jobs).await
            }
        }

        Commands::Classify { unit, json } => {
            let registry = loader.load_registry(&cli.units)?;
            cmd_classify(&registry, unit.as_deref(), json)
        }

        Commands::Diff {
            unit,
            env_a,
            env_b,
            anchor_a,
            anchor_b,
            json,
        } => {
            let registry = Arc::new(loader.load_registry(&cli.units)?);
            let anchor_a = parse_anchor(anchor_a)?;
            let anchor_b = match anchor_b {
                Some(s) => parse_anchor(Some(s))?,
                None => anchor_a,
            };
            let ctx_a = Context::new(env_a, anchor_a);
            let ctx_b = Context::new(env_b, anchor_b);
            cmd_diff(registry, &unit, &ctx_a, &ctx_b, json).await
        }
    }
}

fn parse_anchor(anchor: Option<String>) -> Result<NaiveDate, Box<dyn std::error::Error>> {
    match anchor {
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|_| format!("invalid anchor date '{}', expected YYYY-MM-DD", s).into()),
        None => Ok(chrono::Utc::now().date_naive()),
    }
}

fn cmd_validate(loader: &UnitLoader, units_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating units in {}", units_path.display());

    let defs = loader.load_dir(units_path)?;

    // Per-declaration checks first; then graph-level ones (unknown
    // dependencies, cycles) via registry assembly.
    loader.load_registry(units_path)?;

    let mut total_errors = 0;
    let mut total_warnings = 0;
    let mut failed_units = Vec::new();

    for def in &defs {
        let result = UnitValidator::validate(def);

        let status = if result.is_valid() {
            if result.has_warnings() { "⚠" } else { "✓" }
        } else {
            "✗"
        };

        println!("{} {}", status, def.name);

        for err in &result.errors {
            println!("    \x1b[31m✗\x1b[0m [{}] {}", err.code, err.message);
        }
        for warn in &result.warnings {
            println!("    \x1b[33m⚠\x1b[0m [{}] {}", warn.code, warn.message);
        }

        total_errors += result.errors.len();
        total_warnings += result.warnings.len();
        if !result.is_valid() {
            failed_units.push(def.name.clone());
        }
    }

    println!();

    if total_errors > 0 {
        println!(
            "✗ Validation failed: {} errors, {} warnings in {} units",
            total_errors,
            total_warnings,
            defs.len()
        );
        println!("  Failed: {}", failed_units.join(", "));
        return Err("Validation failed".into());
    } else if total_warnings > 0 {
        println!("⚠ {} units validated with {} warnings", defs.len(), total_warnings);
    } else {
        println!("✓ {} units validated successfully", defs.len());
    }

    Ok(())
}

fn cmd_list(
    loader: &UnitLoader,
    units_path: &PathBuf,
    detailed: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let defs = loader.load_dir(units_path)?;

    if defs.is_empty() {
        println!("No units found in {}", units_path.display());
        return Ok(());
    }

    if detailed {
        for def in &defs {
            println!("{}", def.name);
            println!("  materialization: {}", def.materialization);

            if !def.depends_on.is_empty() {
                println!("  depends_on: {}", def.depends_on.join(", "));
            }
            if !def.unique_key.is_empty() {
                println!("  unique_key: {}", def.unique_key.join(", "));
            }
            if !def.declared_reads.is_empty() {
                let reads: Vec<&str> = def.declared_reads.iter().map(|v| v.as_str()).collect();
                println!("  reads: {}", reads.join(", "));
            }
            if let Some(desc) = &def.description {
                println!("  description: {}", desc);
            }
            if let Some(owner) = &def.owner {
                println!("  owner: {}", owner);
            }
            println!();
        }
    } else {
        let rows: Vec<UnitRow> = defs
            .iter()
            .map(|def| UnitRow {
                name: def.name.clone(),
                materialization: def.materialization.to_string(),
                depends_on: def.depends_on.join(", "),
                reads: def
                    .declared_reads
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::markdown());
        println!("{}", table);
    }

    Ok(())
}

fn cmd_show(
    registry: &UnitRegistry,
    name: &str,
    environment: &str,
    anchor: NaiveDate,
    prior: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let unit = registry.get(name)?;
    let ctx = Context::new(environment, anchor).with_prior_output(prior);
    let rendered = Renderer::render(&unit, &ctx, None)?;

    println!("{} ({})", unit.name, unit.materialization);
    println!("  environment: {}", environment);
    println!("  anchor_date: {}", anchor);
    println!("  fingerprint: {}", rendered.text.fingerprint());
    if !rendered.reads.is_empty() {
        let reads: Vec<&str> = rendered.reads.iter().map(|v| v.as_str()).collect();
        println!("  reads: {}", reads.join(", "));
    }
    if rendered.has_leak() {
        let leaked: Vec<&str> = rendered.leaked.iter().map(|v| v.as_str()).collect();
        println!("  \x1b[33m⚠ undeclared reads: {}\x1b[0m", leaked.join(", "));
    }
    println!("\n{}", rendered.text);

    Ok(())
}

fn cmd_dry_run(
    registry: &UnitRegistry,
    ctx: &Context,
    selected: Option<&[String]>,
) -> Result<(), Box<dyn std::error::Error>> {
    let order = registry.resolve_order()?;
    let names: Vec<&String> = match selected {
        Some(sel) => order.iter().filter(|n| sel.contains(n)).collect(),
        None => order.iter().collect(),
    };

    for name in names {
        let unit = registry.get(name)?;
        let rendered = Renderer::render(&unit, ctx, None)?;
        println!("-- {} [{}]", unit.name, rendered.text.fingerprint());
        println!("{}\n", rendered.text);
    }

    Ok(())
}

async fn cmd_build(
    registry: Arc<UnitRegistry>,
    ctx: &Context,
    selected: Option<&[String]>,
    jobs: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn TargetStore> = Arc::new(MemoryStore::mock());
    let runner = BuildRunner::new(registry, store).with_jobs(jobs);

    let report = runner.run_build(ctx, selected).await?;

    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|o| OutcomeRow {
            unit: o.unit.clone(),
            state: o.state.to_string(),
            rows: o.rows_written,
            elapsed_ms: o.elapsed_ms,
            fingerprint: o
                .rendered_fingerprint
                .as_deref()
                .map(|f| f[..12].to_string())
                .unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::markdown());
    println!("{}", table);

    println!(
        "\n{} committed, {} failed in {}ms",
        report.committed_count(),
        report.failed().len(),
        report.elapsed_ms
    );

    if !report.is_success() {
        let failed: Vec<&str> = report.failed().iter().map(|o| o.unit.as_str()).collect();
        return Err(format!("build failed: {}", failed.join(", ")).into());
    }

    Ok(())
}

fn cmd_classify(
    registry: &UnitRegistry,
    only: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let classifier = Classifier::new();

    let mut classified = Vec::new();
    for unit in registry.units() {
        if let Some(name) = only {
            if unit.name != name {
                continue;
            }
        }
        classified.push((unit.materialization, classifier.classify(unit)?));
    }
    let classifications: Vec<_> = classified.iter().map(|(_, c)| c.clone()).collect();
    if let Some(name) = only {
        if classifications.is_empty() {
            return Err(format!("Unit '{}' not found", name).into());
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&classifications)?);
        return Ok(());
    }

    let rows: Vec<ClassifyRow> = classified
        .iter()
        .map(|(mat, c)| ClassifyRow {
            unit: c.unit.clone(),
            materialization: mat.to_string(),
            verdict: c.verdict.to_string(),
            cause: c.cause.map(|v| v.as_str().to_string()).unwrap_or_default(),
            leaked: c
                .leaked
                .iter()
                .map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::markdown());
    println!("{}", table);

    let sensitive = classifications
        .iter()
        .filter(|c| c.verdict == Verdict::ContextSensitive)
        .count();
    println!(
        "\n{} deterministic, {} context-sensitive",
        classifications.len() - sensitive,
        sensitive
    );

    for c in classifications.iter().filter(|c| c.evidence.is_some()) {
        if let Some(evidence) = &c.evidence {
            println!("\n{}:\n{}", c.unit, evidence);
        }
    }

    Ok(())
}

async fn cmd_diff(
    registry: Arc<UnitRegistry>,
    unit: &str,
    ctx_a: &Context,
    ctx_b: &Context,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Two isolated in-process stores stand in for the two target
    // environments; each build populates its own.
    let store_a: Arc<dyn TargetStore> = Arc::new(MemoryStore::mock());
    let store_b: Arc<dyn TargetStore> = Arc::new(MemoryStore::mock());

    let selection = vec![unit.to_string()];
    BuildRunner::new(registry.clone(), store_a.clone())
        .run_build(ctx_a, Some(&selection))
        .await?;
    BuildRunner::new(registry.clone(), store_b.clone())
        .run_build(ctx_b, Some(&selection))
        .await?;

    let runner = DiffRunner::new(registry.clone());
    let report = runner.run_diff(unit, ctx_a, &store_a, ctx_b, &store_b).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{}: {}@{} vs {}@{}",
        report.unit,
        ctx_a.environment_name,
        ctx_a.anchor_date,
        ctx_b.environment_name,
        ctx_b.anchor_date
    );
    println!("  attribution: {}", report.attribution);
    if let Some(cause) = report.cause {
        println!("  cause: {}", cause);
    }
    println!("  severity: {:?}", report.severity);
    println!("  rows: {} vs {}", report.row_count_a, report.row_count_b);
    println!(
        "  added {} / removed {} / changed {}",
        report.added_rows.len(),
        report.removed_rows.len(),
        report.changed_rows.len()
    );
    println!("  basis: {}", report.basis);

    if report.has_differences() {
        let unit_def = registry.get(unit)?;
        let ra = Renderer::render(&unit_def, ctx_a, None)?;
        let rb = Renderer::render(&unit_def, ctx_b, None)?;
        if ra.text != rb.text {
            println!("\nRendered query diff:\n{}", format_render_diff(ra.text.as_str(), rb.text.as_str()));
        }
    }

    if report.is_alarm() {
        return Err("genuine difference detected".into());
    }

    Ok(())
}
