/// factsync CLI - inspect queries and run them against a set of facts
///
/// Usage:
///   factsync render <query>                              - Validate and re-render canonical query text
///   factsync invert <query>                              - Show the inverses derived from a query
///   factsync run --facts <file> --start <index> <query>  - Run a query over facts loaded from JSON
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use factsync::{Coordinator, Preposition, Query, invert};
use serde_json::Value as JsonValue;
use std::path::PathBuf;

/// factsync - live queries over immutable facts
#[derive(Parser)]
#[command(name = "factsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log engine activity to stderr (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse canonical query text and print it back
    ///
    /// Examples:
    ///   factsync render 'F.type="List" S.list F.type="Task"'
    Render {
        /// Query in canonical text form
        query: String,
    },

    /// Print the inverses of a query
    ///
    /// Examples:
    ///   factsync invert 'F.type="List" S.list F.type="Task" N(S.task F.type="Completion")'
    Invert {
        /// Query in canonical text form
        query: String,
    },

    /// Load facts from a JSON file and run a query from one of them
    ///
    /// The file holds a JSON array of fact documents. Results are printed as
    /// hydrated JSON documents.
    Run {
        /// JSON file containing an array of facts
        #[arg(short, long)]
        facts: PathBuf,

        /// Index of the starting fact in the array
        #[arg(short, long, default_value_t = 0)]
        start: usize,

        /// Query in canonical text form
        query: String,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "factsync=debug",
        _ => "factsync=trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

fn parse_query(text: &str) -> Result<Query> {
    text.parse::<Query>()
        .with_context(|| format!("Invalid query: {}", text))
}

async fn run(facts: PathBuf, start: usize, query: Query) -> Result<()> {
    let content = std::fs::read_to_string(&facts)
        .with_context(|| format!("Failed to read {}", facts.display()))?;
    let documents: Vec<JsonValue> = serde_json::from_str(&content)
        .with_context(|| format!("{} must contain a JSON array of facts", facts.display()))?;

    let coordinator = Coordinator::in_memory();
    let mut roots = Vec::with_capacity(documents.len());
    for (index, document) in documents.iter().enumerate() {
        let reference = coordinator
            .fact(document)
            .await
            .with_context(|| format!("Fact #{} is invalid", index))?;
        roots.push(reference);
    }

    let start_ref = roots.get(start).with_context(|| {
        format!("Start index {} is out of range ({} facts loaded)", start, roots.len())
    })?;

    let results = coordinator
        .query(start_ref, &Preposition::from_query(query))
        .await
        .context("Query failed")?;

    let mut hydrated = Vec::with_capacity(results.len());
    for reference in &results {
        hydrated.push(
            coordinator
                .hydrate(reference)
                .await
                .with_context(|| format!("Failed to hydrate {}", reference.short()))?,
        );
    }

    eprintln!(
        "{} {} from {}",
        "Results:".bold(),
        results.len(),
        start_ref.short().cyan()
    );
    println!("{}", serde_json::to_string_pretty(&hydrated)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Render { query } => {
            let query = parse_query(&query)?;
            println!("{}", query);
        }

        Commands::Invert { query } => {
            let query = parse_query(&query)?;
            let inverses = invert(&query);
            if inverses.is_empty() {
                println!("{}", "No inverses: results never change once seeded.".yellow());
            }
            for (index, inverse) in inverses.iter().enumerate() {
                let trigger = inverse.fact_type.as_deref().unwrap_or("*");
                println!("{} {}", format!("#{}", index + 1).bold(), trigger.cyan().bold());
                println!("  {} {}", "affected:".bright_black(), inverse.affected);
                if let Some(added) = &inverse.added {
                    println!("  {} {}", "added:".green(), added);
                }
                if let Some(removed) = &inverse.removed {
                    println!("  {} {}", "removed:".red(), removed);
                }
            }
        }

        Commands::Run {
            facts,
            start,
            query,
        } => {
            let query = parse_query(&query)?;
            run(facts, start, query).await?;
        }
    }

    Ok(())
}
