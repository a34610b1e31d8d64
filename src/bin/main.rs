//! Prism CLI - validate schemas, compile requests, build rollups
//!
//! Usage:
//!   prism validate <schema>
//!   prism compile <schema> --request <json|file> [--dialect <dialect>]
//!   prism rollups <schema> [--database <sqlite file> --build]
//!
//! Examples:
//!   prism validate cubes.json
//!   prism compile cubes.toml --request '{"measures":["Orders.count"]}' --dialect tsql
//!   prism rollups cubes.json --database warehouse.db --build

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use prism::config::Settings;
use prism::engine::Engine;
use prism::executor::SqliteExecutor;
use prism::model::parse_definitions;
use prism::semantic::{QueryRequest, SchemaRegistry, SqlCompiler};
use prism::sql::Dialect;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "prism")]
#[command(about = "Prism - a semantic-layer query engine that compiles cubes to multi-dialect SQL")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to PRISM_CONFIG, ./prism.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a schema file
    Validate {
        /// Path to the cube definitions (JSON or TOML)
        schema: PathBuf,
    },

    /// Compile a request to SQL against raw sources
    Compile {
        /// Path to the cube definitions (JSON or TOML)
        schema: PathBuf,

        /// Request as inline JSON or a path to a JSON file
        #[arg(short, long)]
        request: String,

        /// SQL dialect to generate
        #[arg(short, long, default_value = "postgres")]
        dialect: DialectArg,

        /// Output format
        #[arg(short, long, default_value = "sql")]
        output: OutputFormat,
    },

    /// List rollups, optionally building them against a SQLite database
    Rollups {
        /// Path to the cube definitions (JSON or TOML)
        schema: PathBuf,

        /// SQLite database holding the source tables
        #[arg(long)]
        database: Option<PathBuf>,

        /// Run one refresh pass before listing partitions
        #[arg(long, requires = "database")]
        build: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum DialectArg {
    Postgres,
    Duckdb,
    Mysql,
    Tsql,
    Snowflake,
    Sqlite,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Duckdb => Dialect::DuckDb,
            DialectArg::Mysql => Dialect::MySql,
            DialectArg::Tsql => Dialect::TSql,
            DialectArg::Snowflake => Dialect::Snowflake,
            DialectArg::Sqlite => Dialect::Sqlite,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Output SQL only
    Sql,
    /// Output SQL with comments
    Verbose,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&settings.logging.level);

    match cli.command {
        Commands::Validate { schema } => cmd_validate(&schema),
        Commands::Compile {
            schema,
            request,
            dialect,
            output,
        } => cmd_compile(&settings, &schema, &request, dialect.into(), output),
        Commands::Rollups {
            schema,
            database,
            build,
        } => cmd_rollups(&settings, &schema, database.as_deref(), build).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_registry(path: &Path) -> Result<SchemaRegistry, String> {
    let source = fs::read_to_string(path)
        .map_err(|e| format!("Error reading file '{}': {}", path.display(), e))?;
    let defs = parse_definitions(&source).map_err(|e| format!("Parse error: {}", e))?;
    SchemaRegistry::register(defs).map_err(|e| format!("Schema error: {}", e))
}

fn cmd_validate(schema: &Path) -> ExitCode {
    match load_registry(schema) {
        Ok(registry) => {
            println!(
                "OK: {} is valid ({} entities, {} joins, {} rollups)",
                schema.display(),
                registry.entities().len(),
                registry.joins().count(),
                registry.pre_aggregations().count()
            );
            for entity in registry.entities() {
                for line in entity.outline() {
                    println!("  {}", line);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_compile(
    settings: &Settings,
    schema: &Path,
    request: &str,
    dialect: Dialect,
    output: OutputFormat,
) -> ExitCode {
    let registry = match load_registry(schema) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let text = if request.trim_start().starts_with('{') {
        request.to_string()
    } else {
        match fs::read_to_string(request) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reading request '{}': {}", request, e);
                return ExitCode::FAILURE;
            }
        }
    };
    let request: QueryRequest = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Invalid request: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let compiler = SqlCompiler::new(Arc::new(registry), settings.query.clone());
    match compiler.compile(&request, dialect) {
        Ok(compiled) => {
            match output {
                OutputFormat::Sql => println!("{}", compiled.sql),
                OutputFormat::Verbose => {
                    println!("-- Prism Compiled SQL");
                    println!("-- Schema: {}", schema.display());
                    println!("-- Dialect: {:?}", dialect);
                    println!("-- Columns: {}", compiled.columns.join(", "));
                    println!();
                    println!("{}", compiled.sql);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_rollups(
    settings: &Settings,
    schema: &Path,
    database: Option<&Path>,
    build: bool,
) -> ExitCode {
    let registry = match load_registry(schema) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Rollups:");
    for rollup in registry.pre_aggregations() {
        let time = match (&rollup.time_dimension, rollup.granularity) {
            (Some(t), Some(g)) => format!(", time: {} by {}", t, g),
            _ => String::new(),
        };
        let partitioned = rollup
            .partition_granularity
            .map(|g| format!(", partitioned by {}", g))
            .unwrap_or_default();
        println!(
            "  - {} ({} measures, {} dimensions{}{})",
            rollup.qualified_name(),
            rollup.measures.len(),
            rollup.dimensions.len(),
            time,
            partitioned
        );
    }

    let Some(database) = database else {
        return ExitCode::SUCCESS;
    };
    let executor = match SqliteExecutor::open(database) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            eprintln!("Error opening database '{}': {}", database.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let engine = match Engine::builder(registry, executor).settings(settings).build() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error starting engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if build {
        let report = engine.scheduler().tick().await;
        println!();
        println!(
            "Refresh: {} dispatched, {} built, {} failed",
            report.dispatched, report.built, report.failed
        );
        if report.failed > 0 {
            print_partitions(&engine);
            return ExitCode::FAILURE;
        }
    }
    print_partitions(&engine);
    ExitCode::SUCCESS
}

fn print_partitions(engine: &Engine) {
    println!();
    println!("Partitions:");
    for rollup in engine.registry().pre_aggregations() {
        for slot in engine.store().partitions(&rollup.qualified_name()) {
            let table = slot
                .snapshot()
                .map(|s| s.table.clone())
                .unwrap_or_else(|| "-".to_string());
            println!("  - {} {} {}", slot.key, slot.status(), table);
        }
    }
}
