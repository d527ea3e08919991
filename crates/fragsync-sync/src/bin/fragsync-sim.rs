//! `fragsync-sim`: simulator and merge preview for fragsync

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use fragsync_merge::MergeEngine;
use fragsync_model::{ConfigFragment, ResourceType, SourceRef};
use fragsync_sync::sim::{run_simulation, FaultProfile, SimulatorConfig};
use fragsync_sync::telemetry::init_tracing;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;

/// One fragment in a `merge` input file
#[derive(Debug, Deserialize)]
struct FragmentInput {
    source: SourceRef,
    #[serde(default)]
    priority: i32,
    payload: JsonValue,
}

fn cli() -> Command {
    Command::new("fragsync-sim")
        .version(fragsync_sync::VERSION)
        .about("fragsync simulator and merge preview")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run concurrent producers against a faulty simulated remote")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("keys")
                        .long("keys")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Number of resource keys"),
                )
                .arg(
                    Arg::new("producers")
                        .long("producers")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Producers per key"),
                )
                .arg(
                    Arg::new("rounds")
                        .long("rounds")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Contributions per producer"),
                )
                .arg(
                    Arg::new("teardown")
                        .long("teardown")
                        .default_value("2")
                        .value_parser(value_parser!(usize))
                        .help("Keys withdrawn after the first sync"),
                )
                .arg(
                    Arg::new("transient-rate")
                        .long("transient-rate")
                        .default_value("0.2")
                        .value_parser(value_parser!(f64))
                        .help("Probability of a retryable remote failure"),
                )
                .arg(
                    Arg::new("permanent-rate")
                        .long("permanent-rate")
                        .default_value("0.02")
                        .value_parser(value_parser!(f64))
                        .help("Probability of a rejected remote call"),
                )
                .arg(
                    Arg::new("lost-rate")
                        .long("lost-rate")
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Probability a write is applied but its response lost"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("merge")
                .about("Merge a file of fragments and print the document")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("YAML or JSON list of {source, priority, payload}"),
                )
                .arg(
                    Arg::new("type")
                        .long("type")
                        .default_value("tunnel-config")
                        .help("Resource type selecting the merge schema"),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json")).context("installing tracing subscriber")?;

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("merge", args)) => merge(args),
        _ => bail!("unknown subcommand"),
    }
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<()> {
    let defaults = SimulatorConfig::default();
    let config = SimulatorConfig {
        seed: arg(args, "seed")?,
        keys: arg(args, "keys")?,
        producers_per_key: arg(args, "producers")?,
        rounds: arg(args, "rounds")?,
        teardown_keys: arg(args, "teardown")?,
        faults: FaultProfile {
            transient_rate: arg(args, "transient-rate")?,
            permanent_rate: arg(args, "permanent-rate")?,
            lost_response_rate: arg(args, "lost-rate")?,
        },
        ..defaults
    };

    let report = run_simulation(config).await?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.generate_text());
    }
    if !report.passed() {
        bail!("{} invariant violation(s)", report.violations.len());
    }
    Ok(())
}

fn merge(args: &ArgMatches) -> anyhow::Result<()> {
    let path: PathBuf = arg(args, "file")?;
    let resource_type: ResourceType = args
        .get_one::<String>("type")
        .map_or(Ok(ResourceType::TunnelConfig), |s| s.parse())?;

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    // YAML is a superset of JSON
    let inputs: Vec<FragmentInput> = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    let fragments: Vec<ConfigFragment> = inputs
        .into_iter()
        .map(|input| ConfigFragment::new(input.source, input.payload, input.priority))
        .collect();

    let outcome = MergeEngine::with_defaults().merge(&resource_type, &fragments)?;
    let output = json!({
        "resourceType": resource_type.as_str(),
        "hash": outcome.document.hash().to_string(),
        "document": outcome.document.as_value(),
        "provenance": outcome.provenance.to_string_map(),
        "contributors": outcome
            .contributors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn arg<T: Clone + Send + Sync + 'static>(args: &ArgMatches, name: &str) -> anyhow::Result<T> {
    args.get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing --{name}"))
}
