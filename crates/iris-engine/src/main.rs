//! `iris` command line: configuration and plan checks, and fixture simulation

use anyhow::{bail, Context as _};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use iris_core::{IrisConfig, Mode, PluginConfig};
use iris_engine::{EscalationEngine, Fixture, InMemoryPlanStore};
use iris_sender::{InMemoryDirectory, MessageRenderer};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn cli() -> Command {
    let config = Arg::new("config")
        .long("config")
        .env("IRIS_CONFIG")
        .value_parser(value_parser!(PathBuf))
        .help("Configuration file (.toml, .yaml or .yml)");
    let fixture = Arg::new("fixture")
        .long("fixture")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("YAML fixture with templates, directory, plans and incidents");

    Command::new("iris")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Iris incident escalation engine")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .subcommand(
            Command::new("check-config")
                .about("Load and validate configuration")
                .arg(config.clone()),
        )
        .subcommand(
            Command::new("check-plan")
                .about("Validate the plans of a fixture")
                .arg(fixture.clone()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the incidents of a fixture in virtual time with log plugins")
                .arg(config)
                .arg(fixture)
                .arg(
                    Arg::new("ack-after-secs")
                        .long("ack-after-secs")
                        .value_parser(value_parser!(u64))
                        .help("Acknowledge every incident after this many seconds"),
                )
                .arg(
                    Arg::new("horizon-secs")
                        .long("horizon-secs")
                        .default_value("86400")
                        .value_parser(value_parser!(u64))
                        .help("Stop simulating after this many seconds"),
                ),
        )
}

fn init_logging(matches: &ArgMatches) {
    let default = if matches.get_flag("verbose") {
        "iris_engine=debug,iris_sender=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let (json, plain) = if matches.get_flag("json-logs") {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}

fn load_config(args: &ArgMatches) -> anyhow::Result<IrisConfig> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => IrisConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IrisConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn load_fixture(args: &ArgMatches) -> anyhow::Result<Fixture> {
    let path = args
        .get_one::<PathBuf>("fixture")
        .context("--fixture is required")?;
    Fixture::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn check_config(args: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(args)?;
    println!("configuration OK");
    println!("  workers:        {}", config.sender.workers);
    println!("  queue capacity: {}", config.sender.queue_capacity);
    println!("  quench window:  {}s", config.quench.window_secs);
    println!(
        "  rate limit:     {} per {}s",
        config.rate_limit.capacity, config.rate_limit.refill_interval_secs
    );
    for (mode, plugin) in &config.plugins {
        println!("  plugin {mode}: {plugin:?}");
    }
    Ok(())
}

fn check_plan(args: &ArgMatches) -> anyhow::Result<()> {
    let fixture = load_fixture(args)?;
    let failures = fixture.check_plans();
    for plan in &fixture.plans {
        match failures.iter().find(|(name, _)| *name == plan.name) {
            Some((_, e)) => println!("{}: INVALID ({e})", plan.name),
            None => println!("{}: OK ({} steps)", plan.name, plan.steps.len()),
        }
    }
    if !failures.is_empty() {
        bail!("{} of {} plans invalid", failures.len(), fixture.plans.len());
    }
    Ok(())
}

/// Every mode the fixture may send on
fn fixture_modes(fixture: &Fixture) -> BTreeSet<Mode> {
    let mut modes: BTreeSet<Mode> = fixture
        .users
        .iter()
        .flat_map(|u| u.contacts.keys().cloned())
        .collect();
    modes.extend(
        fixture
            .plans
            .iter()
            .filter_map(|p| p.tracking.as_ref().map(|t| t.mode.clone())),
    );
    modes
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<()> {
    let fixture = load_fixture(args)?;
    let mut config = load_config(args)?;
    for mode in fixture_modes(&fixture) {
        config.plugins.insert(mode, PluginConfig::Log);
    }
    for (plan, e) in fixture.check_plans() {
        tracing::warn!(plan = %plan, error = %e, "fixture plan is invalid");
    }

    let directory = Arc::new(InMemoryDirectory::new());
    fixture.load_directory(&directory);
    let plans = Arc::new(InMemoryPlanStore::new());
    fixture.load_plans(&plans);
    let renderer = Arc::new(MessageRenderer::new());
    fixture.load_templates(&renderer)?;

    let engine = EscalationEngine::builder(config)
        .with_directory(directory)
        .with_plan_store(plans)
        .with_renderer(renderer)
        .build()?;

    let mut attempts = engine.subscribe_attempts();
    let printer = tokio::spawn(async move {
        loop {
            match attempts.recv().await {
                Ok(a) => println!(
                    "attempt  {} {} {}:{} #{} {}",
                    a.message_id, a.target, a.mode, a.destination, a.attempt, a.outcome
                ),
                Err(RecvError::Lagged(skipped)) => println!("attempt  ... {skipped} skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let started = tokio::time::Instant::now();
    let mut incidents = Vec::new();
    for incident in fixture.incidents.clone() {
        let plan = incident.plan.clone();
        match engine.start_run(incident).await {
            Ok(id) => incidents.push(id),
            Err(e) => println!("start    {plan}: {e}"),
        }
    }

    if let Some(secs) = args.get_one::<u64>("ack-after-secs") {
        tokio::time::sleep(Duration::from_secs(*secs)).await;
        for id in &incidents {
            engine.acknowledge(*id, Some("simulator".into())).await?;
        }
    }

    let horizon = Duration::from_secs(*args.get_one::<u64>("horizon-secs").unwrap_or(&86_400));
    while engine.active_runs() > 0 && started.elapsed() < horizon {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // let in-flight deliveries land before reporting
    tokio::time::sleep(Duration::from_secs(1)).await;

    for id in &incidents {
        if let Some(run) = engine.get_run_state(*id).await {
            println!(
                "run      {} plan={} state={} step={:?} round={} failures={}",
                run.incident_id,
                run.plan,
                run.state,
                run.ordinal,
                run.round,
                run.failures.len()
            );
        }
    }
    println!(
        "elapsed  {}s virtual, {} audit entries",
        started.elapsed().as_secs(),
        engine.audit().len()
    );

    engine.shutdown().await;
    printer.abort();
    engine.audit().verify_integrity()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_logging(&matches);

    match matches.subcommand() {
        Some(("check-config", args)) => check_config(args),
        Some(("check-plan", args)) => check_plan(args),
        Some(("simulate", args)) => {
            // virtual time: idle periods are skipped instead of waited out
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()?;
            runtime.block_on(simulate(args))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn simulate_parses_flags() {
        let matches = cli()
            .try_get_matches_from([
                "iris",
                "--json-logs",
                "simulate",
                "--fixture",
                "demo.yaml",
                "--ack-after-secs",
                "90",
            ])
            .unwrap();
        assert!(matches.get_flag("json-logs"));
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(args.get_one::<u64>("ack-after-secs"), Some(&90));
        assert_eq!(args.get_one::<u64>("horizon-secs"), Some(&86_400));
    }

    #[test]
    fn check_plan_requires_fixture() {
        assert!(cli().try_get_matches_from(["iris", "check-plan"]).is_err());
    }
}
