//! Keyseek command line
//!
//! Loads a JSON fixture (documents, indexes, pipeline, optional hint and
//! collation), plans the pipeline and prints the explain output and results.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use keyseek_core::{
    AggregateRequest, Aggregator, Collation, Collection, Config, Explain, Hint, IndexSpec,
    KeyPattern, ScanStats, Value,
};

#[derive(Parser, Debug)]
#[command(name = "keyseek", version, about = "Plan and run grouped aggregations")]
struct Args {
    /// JSON fixture with documents, indexes and a pipeline
    fixture: PathBuf,

    /// Configuration file
    #[arg(short, long, default_value = "keyseek.toml")]
    config: PathBuf,

    /// Print the plan without running it
    #[arg(long)]
    explain: bool,

    /// Print explain output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default)]
    documents: Vec<serde_json::Value>,
    #[serde(default)]
    indexes: Vec<FixtureIndex>,
    pipeline: serde_json::Value,
    #[serde(default)]
    hint: serde_json::Value,
    #[serde(default)]
    collation: Option<Collation>,
}

#[derive(Debug, Deserialize)]
struct FixtureIndex {
    key: serde_json::Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    collation: Option<Collation>,
}

fn default_namespace() -> String {
    "test.fixture".to_string()
}

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("keyseek=debug,keyseek_core=debug")
    } else {
        EnvFilter::new("keyseek=info,keyseek_core=info")
    }
}

fn main() -> anyhow::Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .compact();

    Registry::default()
        .with(get_env_filter())
        .with(stderr_layer)
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config)?;

    let raw = fs::read_to_string(&args.fixture)
        .with_context(|| format!("reading fixture {}", args.fixture.display()))?;
    let fixture: Fixture = serde_json::from_str(&raw)
        .with_context(|| format!("parsing fixture {}", args.fixture.display()))?;

    let collection = Arc::new(load_collection(&fixture)?);
    tracing::debug!(
        namespace = %fixture.namespace,
        documents = collection.len(),
        "Loaded fixture"
    );

    let request = AggregateRequest::from_json(&fixture.pipeline)?
        .with_collation(fixture.collation.clone())
        .with_hint(Hint::from_json(&fixture.hint)?);
    let aggregator = Aggregator::new(collection, config);

    if args.explain {
        let explain = aggregator.explain(&request)?;
        print_explain(&explain, args.json)?;
        return Ok(());
    }

    let output = aggregator.aggregate(&request)?;
    print_explain(&output.explain, args.json)?;
    if let Some(stats) = output.stats {
        print_stats(&stats);
    }
    print_documents(&output.documents);

    Ok(())
}

fn load_collection(fixture: &Fixture) -> anyhow::Result<Collection> {
    let collection = Collection::new(fixture.namespace.clone());
    for doc in &fixture.documents {
        collection.insert(Value::from_json(doc.clone()))?;
    }
    for index in &fixture.indexes {
        let mut spec = IndexSpec::new(KeyPattern::from_json(&index.key)?);
        if let Some(name) = &index.name {
            spec = spec.named(name.clone());
        }
        if let Some(collation) = &index.collation {
            spec = spec.with_collation(collation.clone());
        }
        collection.create_index(spec)?;
    }
    Ok(collection)
}

fn print_explain(explain: &Explain, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&explain.to_json())?);
        return Ok(());
    }

    let chain: Vec<String> = explain
        .stage_types()
        .iter()
        .map(|stage| stage.as_str().to_string())
        .collect();
    let chain = chain.join(" <- ");

    println!("{} {}", "Namespace:".bold(), explain.namespace);
    if explain.uses_distinct_scan() {
        println!("{} {}", "Winning plan:".bold(), chain.bright_green());
    } else {
        println!("{} {}", "Winning plan:".bold(), chain.bright_yellow());
    }
    for stage in [
        keyseek_core::query::StageType::DistinctScan,
        keyseek_core::query::StageType::Ixscan,
    ] {
        if let Some(scan) = explain.find_stage(stage)
            && let Some(name) = &scan.index_name
        {
            println!(
                "{} {} ({})",
                "Index:".bold(),
                name.bright_cyan(),
                scan.direction.as_deref().unwrap_or("forward")
            );
        }
    }
    if !explain.trailing_stages.is_empty() {
        println!(
            "{} {}",
            "Trailing stages:".bold(),
            explain.trailing_stages.join(", ")
        );
    }
    if let Some(reason) = &explain.ineligible_reason {
        println!("{} {}", "Fallback:".bold(), reason.bright_yellow());
    }
    Ok(())
}

fn print_stats(stats: &ScanStats) {
    println!(
        "{} keys examined: {}, docs examined: {}, seeks: {}",
        "Scan:".bold(),
        stats.keys_examined.to_string().bright_cyan(),
        stats.docs_examined.to_string().bright_cyan(),
        stats.seeks.to_string().bright_cyan()
    );
}

fn print_documents(documents: &[Value]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "document"]);
    for (i, doc) in documents.iter().enumerate() {
        table.add_row(vec![(i + 1).to_string(), doc.to_json().to_string()]);
    }
    println!("{table}");
    println!("{} document(s)", documents.len().to_string().bright_green());
}
