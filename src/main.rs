//! `reef` command-line entry point.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reef::{WalkthroughReport, core_schema};
use reef_settings::{load_settings, load_settings_from_path};

/// Walk through engine, Core and ORM database access over `SQLite`.
#[derive(Parser, Debug)]
#[command(name = "reef", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.reef/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tutorial and print what each step observed.
    Walkthrough {
        /// Database target, e.g. `sqlite:///tutorial.db`.
        #[arg(long)]
        url: Option<String>,

        /// Log every statement at INFO.
        #[arg(long)]
        echo: bool,
    },
    /// Print the tutorial schema DDL.
    Ddl,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    if cli.json_logs {
        settings.logging.json = true;
    }
    if let Command::Walkthrough { url, echo } = &cli.command {
        if let Some(url) = url {
            settings.database.url.clone_from(url);
        }
        settings.database.echo |= *echo;
    }

    reef_telemetry::init(&settings.logging).context("failed to initialize logging")?;
    tracing::debug!(?settings, "settings resolved");

    match cli.command {
        Command::Walkthrough { .. } => {
            let report = reef::run(&settings)?;
            print_report(&report);
        }
        Command::Ddl => {
            for statement in core_schema()?.metadata.create_all_sql()? {
                println!("{statement}\n");
            }
        }
    }
    Ok(())
}

fn print_report(report: &WalkthroughReport) {
    println!("== textual SQL");
    for (x, y) in &report.text_rows {
        println!("x: {x}  y: {y}");
    }
    println!("-- WHERE y > 2");
    for (x, y) in &report.filtered_rows {
        println!("x: {x}  y: {y}");
    }
    println!("-- session, WHERE y > 6 ORDER BY x, y");
    for (x, y) in &report.session_rows {
        println!("x: {x}  y: {y}");
    }

    println!("\n== metadata");
    println!("created: {}", report.created_tables.join(", "));
    for ddl in &report.ddl {
        println!("{ddl}");
    }
    println!("reflected some_table: {}", report.reflected_columns.join(", "));

    println!("\n== Core");
    println!("{}", report.select_sql);
    println!("{}", report.first_row);
    println!("{}", report.first_user);

    println!("\n== ORM");
    println!("session.new: [{}]", report.pending_before_commit.join(", "));
    println!("get: {}", report.fetched);
    println!(
        "updated fullname: {}",
        report.updated_fullname.as_deref().unwrap_or("None")
    );
    println!("deleted: {}", report.squidward_deleted);
    println!(
        "rollback: {} rows before, {} after",
        report.rollback_counts.0, report.rollback_counts.1
    );

    println!("\n== relationships");
    println!("{}", report.pkrabs);
    println!("{}", report.pkrabs_address);
    for (table, key) in &report.relationship_inserts {
        println!("INSERT {table} -> {key}");
    }
}
