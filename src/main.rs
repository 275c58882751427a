mod cli;

use anyhow::{anyhow, Result};
use clap::Parser;
use cli::{Command, PhasesArgs, RootArgs, RunArgs};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use test_genie::catalog::DEFAULT_PHASE_TIMEOUT;
use test_genie::executor::render_summary;
use test_genie::{default_catalog, execute, Environment, ExecutionPlan, RunContext, Toolbox};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = RootArgs::parse();
    init_tracing();
    match dispatch(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn dispatch(args: RootArgs) -> Result<i32> {
    match args.command {
        Command::Run(args) => run(args),
        Command::Phases(args) => phases(args),
    }
}

fn seconds(flag: &str, value: Option<f64>) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(anyhow!("--{flag} must be a positive number of seconds, got {secs}")),
    }
}

fn run(args: RunArgs) -> Result<i32> {
    let env = Environment::from_scenario_dir(&args.scenario_dir)?.with_ui_url(args.ui_url);
    if !env.scenario_dir.is_dir() {
        return Err(anyhow!(
            "scenario directory {} does not exist",
            env.scenario_dir.display()
        ));
    }
    let root = RunContext::background();
    install_interrupt_handler(&root);
    let ctx = match seconds("timeout", args.timeout)? {
        Some(timeout) => root.with_timeout(timeout),
        None => root,
    };
    let plan = ExecutionPlan::phases(args.phases)
        .fail_fast(args.fail_fast)
        .phase_timeout(seconds("phase-timeout", args.phase_timeout)?);
    let catalog = default_catalog(DEFAULT_PHASE_TIMEOUT);
    let tools = Toolbox::system();

    tracing::info!(scenario = env.scenario_name.as_str(), "starting run");
    let summary = execute(&ctx, &catalog, &env, &tools, &plan)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", render_summary(&summary));
    }
    Ok(summary.exit_code())
}

/// SIGINT/SIGTERM/SIGHUP cancel the run so the in-flight phase terminates
/// its children, seed sessions clean up, and the remaining phases still get
/// pointers and a summary. A second signal exits immediately.
fn install_interrupt_handler(root: &RunContext) {
    let root = root.clone();
    let signalled = AtomicBool::new(false);
    if let Err(err) = ctrlc::set_handler(move || {
        if signalled.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("interrupted; cancelling the run (signal again to exit now)");
        root.cancel();
    }) {
        tracing::warn!(error = %err, "failed to install interrupt handler");
    }
}

fn phases(args: PhasesArgs) -> Result<i32> {
    let catalog = default_catalog(DEFAULT_PHASE_TIMEOUT);
    let descriptors = catalog.descriptors();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(0);
    }
    for descriptor in descriptors {
        println!(
            "{:<13} weight {:>3}  timeout {:>5.0}s{}  {}",
            descriptor.name,
            descriptor.weight,
            descriptor.default_timeout_seconds,
            if descriptor.optional { "  optional" } else { "" },
            descriptor.description
        );
    }
    Ok(0)
}
