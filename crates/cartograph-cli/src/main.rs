//! cartograph command-line interface.
//!
//! Plans and applies the synthesized schema for a project, inspects the
//! world records, and runs schema edits.

mod config;

use cartograph::{
    ColumnDescriptor, Connection, Engine, Plan, StartupReport, WorldRecord,
};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::error::Error;
use tracing::debug;

/// Schema synthesis and migration for declarative backends
#[derive(Parser, Debug)]
#[command(name = "cartograph")]
#[command(version, about)]
struct Cli {
    /// Database connection URL (overrides DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what startup would change, without touching the database
    Plan {
        /// Print the DDL instead of a summary
        #[arg(long)]
        sql: bool,
    },
    /// Bring the database in line with the declarations
    Sync,
    /// List world records, or print one table's stored schema
    World { table: Option<String> },
    /// Rename a column
    Rename {
        table: String,
        column: String,
        new_name: String,
    },
    /// Add a column to a table (and its companions)
    AddColumn {
        table: String,
        name: String,
        #[arg(long, default_value = "label")]
        column_type: String,
        #[arg(long, default_value = "varchar(100)")]
        data_type: String,
        #[arg(long)]
        nullable: bool,
    },
    /// Drop a column
    DeleteColumn { table: String, column: String },
    /// Drop a table with its join tables and companions
    DeleteTable { table: String },
}

/// Which backend a URL points at.
#[derive(Debug, PartialEq)]
enum Target {
    Postgres(String),
    Mysql(String),
    Sqlite(String),
}

impl Target {
    fn from_url(url: &str) -> Result<Self, String> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Target::Postgres(url.to_string()))
        } else if url.starts_with("mysql://") {
            Ok(Target::Mysql(url.to_string()))
        } else if let Some(path) = url.strip_prefix("sqlite://") {
            Ok(Target::Sqlite(path.to_string()))
        } else {
            Err(format!("unsupported database URL: {}", mask_password(url)))
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let loaded = config::load()?;
    let url = loaded.database_url(cli.database_url.as_deref())?;
    debug!(root = %loaded.root, database = %mask_password(&url), "configuration loaded");

    match Target::from_url(&url)? {
        Target::Postgres(url) => {
            let pool = deadpool_postgres::Config {
                url: Some(url),
                ..Default::default()
            }
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )?;
            let conn = pool.get().await?;
            execute(conn, &loaded, cli.command).await
        }
        #[cfg(feature = "sqlite")]
        Target::Sqlite(path) => {
            let conn = cartograph::SqliteConnection::open(path)?;
            execute(conn, &loaded, cli.command).await
        }
        #[cfg(feature = "mysql")]
        Target::Mysql(url) => {
            let conn = cartograph::MySqlConnection::connect(&url).await?;
            execute(conn, &loaded, cli.command).await
        }
        #[allow(unreachable_patterns)]
        other => Err(format!("{:?} support was not compiled in", other).into()),
    }
}

async fn execute<C: Connection>(
    conn: C,
    loaded: &config::Loaded,
    command: Commands,
) -> Result<(), Box<dyn Error>> {
    let engine_config = loaded.config.engine.clone();
    let declarations = loaded.declarations()?;

    if let Commands::Plan { sql } = command {
        let (expansion, plan) = Engine::plan(&conn, &engine_config, declarations).await?;
        for problem in &expansion.problems {
            println!("{} {}", "warning:".yellow().bold(), problem);
        }
        if sql {
            print!("{}", plan.to_sql(conn.dialect()));
        } else {
            print_plan(&plan);
        }
        return Ok(());
    }

    let (engine, report) = Engine::start(conn, engine_config, declarations).await?;
    print_startup(&report);

    match command {
        Commands::Plan { .. } | Commands::Sync => {}
        Commands::World { table: None } => {
            for record in engine.snapshot().records() {
                print_record(record);
            }
        }
        Commands::World { table: Some(table) } => {
            let snapshot = engine.snapshot();
            let record = snapshot
                .world_record(&table)
                .ok_or_else(|| format!("no world record for table {}", table))?;
            println!("{}", serde_json::to_string_pretty(&record.schema)?);
        }
        Commands::Rename {
            table,
            column,
            new_name,
        } => {
            engine.rename_column(&table, &column, &new_name).await?;
            println!("{} {}.{} -> {}", "renamed".green(), table, column, new_name);
        }
        Commands::AddColumn {
            table,
            name,
            column_type,
            data_type,
            nullable,
        } => {
            let mut column = ColumnDescriptor::new(&name, &column_type, &data_type);
            column.nullable = nullable;
            let report = engine.add_column(&table, column).await?;
            for statement in &report.applied {
                println!("{} {}", "applied".green(), statement);
            }
        }
        Commands::DeleteColumn { table, column } => {
            engine.delete_column(&table, &column).await?;
            println!("{} {}.{}", "dropped".red(), table, column);
        }
        Commands::DeleteTable { table } => {
            let errors = engine.delete_table(&table).await;
            if !errors.is_empty() {
                for e in &errors {
                    eprintln!("{} {}", "error:".red().bold(), e);
                }
                return Err(format!("{} error(s) deleting {}, nothing was changed", errors.len(), table).into());
            }
            println!("{} {}", "dropped".red(), table);
        }
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("{}", "No changes detected.".dimmed());
        return;
    }
    println!(
        "{} ({} changes)\n",
        "Changes detected".bold(),
        plan.change_count()
    );
    for table_diff in &plan.table_diffs {
        println!("  {}:", table_diff.table.bold());
        for change in &table_diff.changes {
            println!("    {}", change.green());
        }
    }
}

fn print_startup(report: &StartupReport) {
    for problem in &report.problems {
        eprintln!("{} {}", "warning:".yellow().bold(), problem);
    }
    for failure in &report.reconcile.failures {
        eprintln!("{} {}", "failed:".red().bold(), failure);
    }
    for (table, e) in &report.world.failures {
        eprintln!("{} world record for {}: {}", "failed:".red().bold(), table, e);
    }
    println!(
        "{} {} DDL statement(s), {} inserted, {} updated, {} unchanged",
        "synchronized:".bold(),
        report.ddl_count(),
        report.world.inserted.len(),
        report.world.updated.len(),
        report.world.unchanged
    );
}

fn print_record(record: &WorldRecord) {
    let mut flags = Vec::new();
    if record.is_top_level {
        flags.push("top-level");
    }
    if record.is_hidden {
        flags.push("hidden");
    }
    if record.is_join_table {
        flags.push("join");
    }
    if record.is_state_tracking_enabled {
        flags.push("states");
    }
    println!(
        "{:>4}  {:<40} {:>3} columns  {:>3} relations  default {}  {}",
        record.id,
        record.table_name.bold(),
        record.schema.table.columns.len(),
        record.schema.relations.len(),
        record.default_permission,
        flags.join(", ").dimmed()
    );
}

/// Mask the password in a database URL for display.
fn mask_password(url: &str) -> String {
    if let Some(start) = url.find("://")
        && let Some(at) = url.rfind('@')
        && at > start
        && let Some(colon) = url[start + 3..at].find(':')
    {
        let user = &url[start + 3..start + 3 + colon];
        return format!("{}{}:***{}", &url[..start + 3], user, &url[at..]);
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_url() {
        assert_eq!(
            Target::from_url("postgres://u:p@localhost/app").unwrap(),
            Target::Postgres("postgres://u:p@localhost/app".to_string())
        );
        assert_eq!(
            Target::from_url("sqlite://data/app.db").unwrap(),
            Target::Sqlite("data/app.db".to_string())
        );
        assert!(matches!(
            Target::from_url("mysql://root@db/app").unwrap(),
            Target::Mysql(_)
        ));
        let err = Target::from_url("oracle://scott:tiger@db").unwrap_err();
        assert!(err.contains("scott:***@db"), "{}", err);
    }

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://admin:hunter2@db:5432/app"),
            "postgres://admin:***@db:5432/app"
        );
        assert_eq!(mask_password("postgres://db/app"), "postgres://db/app");
        assert_eq!(mask_password("sqlite://app.db"), "sqlite://app.db");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["cartograph", "rename", "project", "summary", "blurb"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Rename { ref new_name, .. } if new_name == "blurb"));

        let cli = Cli::try_parse_from([
            "cartograph",
            "add-column",
            "project",
            "due",
            "--data-type",
            "timestamp",
            "--nullable",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::AddColumn { ref data_type, nullable: true, .. } if data_type == "timestamp"
        ));
    }
}
