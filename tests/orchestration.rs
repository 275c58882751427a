//! Catalog, executor and report invariants across every built-in phase.

mod common;

use common::{toolbox, Scenario, StubCommands};
use std::sync::Arc;
use std::time::Duration;
use test_genie::catalog::{normalize_phase_name, CANONICAL_PHASES, DEFAULT_PHASE_TIMEOUT};
use test_genie::context::ContextError;
use test_genie::executor::PhaseStatus;
use test_genie::observe::standardize_failure_class;
use test_genie::{default_catalog, execute, Environment, ExecutionPlan, FailureClass, RunContext};

#[test]
fn default_catalog_covers_every_canonical_phase() {
    let catalog = default_catalog(Duration::from_secs(120));
    assert_eq!(catalog.len(), CANONICAL_PHASES.len());
    for name in CANONICAL_PHASES {
        let spec = catalog.lookup(name).expect(name);
        assert!(!spec.default_timeout.is_zero(), "{name}");
    }
    let lint = catalog.lookup("lint").expect("lint");
    assert_eq!(lint.default_timeout, Duration::from_secs(30));
}

#[test]
fn catalog_order_is_weight_then_name_and_only_performance_is_optional() {
    let catalog = default_catalog(DEFAULT_PHASE_TIMEOUT);
    let all = catalog.all();
    for pair in all.windows(2) {
        assert!((pair[0].weight, &pair[0].name) < (pair[1].weight, &pair[1].name));
    }
    for spec in all {
        assert_eq!(spec.optional, spec.name == "performance", "{}", spec.name);
    }
}

#[test]
fn phase_names_normalize() {
    assert_eq!(normalize_phase_name(" Unit ").as_deref(), Some("unit"));
    assert_eq!(normalize_phase_name("   "), None);
    assert_eq!(normalize_phase_name(""), None);
}

#[test]
fn failure_classes_are_closed() {
    let closed = [
        FailureClass::Misconfiguration,
        FailureClass::MissingDependency,
        FailureClass::Timeout,
        FailureClass::System,
    ];
    for raw in ["", "timeout", "TIMEOUT", "budget_exceeded", "stale-bundle", "💥"] {
        assert!(closed.contains(&standardize_failure_class(raw)), "{raw}");
    }
}

#[test]
fn every_runner_reports_error_and_class_together() {
    let scenario = Scenario::canonical("picker-wheel");
    scenario.write("cli/test/basic.bats", "@test \"help\" { run picker-wheel help; }\n");
    let env = Environment::from_scenario_dir(&scenario.dir).expect("env");
    let tools = toolbox(Arc::new(StubCommands::new()));
    let catalog = default_catalog(Duration::from_secs(60));
    for spec in catalog.all() {
        let mut log: Vec<u8> = Vec::new();
        let report = spec.runner.run(&RunContext::background(), &env, &tools, &mut log);
        assert_eq!(
            report.err.is_some(),
            report.failure_class.is_some(),
            "{}: {:?}",
            spec.name,
            report.err
        );
    }
}

#[test]
fn cancelled_context_stops_every_runner_before_any_subprocess() {
    let scenario = Scenario::canonical("picker-wheel");
    scenario.write("api/go.mod", "module picker-wheel/api\n");
    let env = Environment::from_scenario_dir(&scenario.dir).expect("env");
    let stub = Arc::new(StubCommands::new());
    let tools = toolbox(stub.clone());
    let ctx = RunContext::background();
    ctx.cancel();
    for spec in default_catalog(DEFAULT_PHASE_TIMEOUT).all() {
        let mut log: Vec<u8> = Vec::new();
        let report = spec.runner.run(&ctx, &env, &tools, &mut log);
        assert_eq!(report.failure_class, Some(FailureClass::System), "{}", spec.name);
        let cause = report
            .err
            .as_ref()
            .and_then(|err| err.downcast_ref::<ContextError>());
        assert_eq!(cause, Some(&ContextError::Canceled), "{}", spec.name);
    }
    assert!(stub.calls().is_empty(), "{:?}", stub.calls());
}

#[test]
fn every_executed_phase_leaves_a_pointer() {
    let scenario = Scenario::canonical("picker-wheel");
    let env = Environment::from_scenario_dir(&scenario.dir).expect("env");
    let tools = toolbox(Arc::new(StubCommands::new()));
    let catalog = default_catalog(Duration::from_secs(60));
    let summary = execute(
        &RunContext::background(),
        &catalog,
        &env,
        &tools,
        &ExecutionPlan::all(),
    )
    .expect("execute");
    assert_eq!(summary.results.len(), CANONICAL_PHASES.len());
    for result in &summary.results {
        let pointer = scenario.read_json(&format!("coverage/phase-results/{}.json", result.name));
        assert_eq!(pointer["phase"], result.name.as_str());
        assert_eq!(pointer["scenario"], "picker-wheel");
        assert_eq!(pointer["status"], result.status.as_str());
        assert!(pointer["updated_at"].as_str().is_some_and(|at| at.ends_with('Z')));
        assert!(scenario
            .dir
            .join(format!("coverage/logs/{}.log", result.name))
            .is_file());
    }
    let written = scenario.read_json("coverage/phase-results/summary.json");
    assert_eq!(written["failed"], summary.failed);
}

#[test]
fn fail_fast_records_the_rest_as_skipped() {
    let scenario = Scenario::canonical("picker-wheel");
    let env = Environment::from_scenario_dir(&scenario.dir).expect("env");
    let tools = toolbox(Arc::new(StubCommands::new().missing("jq")));
    let plan = ExecutionPlan::phases(["dependencies", "structure", "docs"]).fail_fast(true);
    let summary = execute(
        &RunContext::background(),
        &default_catalog(DEFAULT_PHASE_TIMEOUT),
        &env,
        &tools,
        &plan,
    )
    .expect("execute");
    let statuses: Vec<PhaseStatus> = summary.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![PhaseStatus::Failed, PhaseStatus::Skipped, PhaseStatus::Skipped]
    );
    assert!(summary.results[1..].iter().all(|r| r.classification.is_none()
        && r.remediation.as_deref().is_some_and(|text| text.contains("fail-fast"))));
    assert_eq!(summary.exit_code(), 1);
}

#[test]
fn cancelling_the_root_mid_run_still_writes_every_pointer_and_the_summary() {
    let scenario = Scenario::canonical("picker-wheel");
    scenario.write("api/go.mod", "module picker-wheel/api\n");
    let env = Environment::from_scenario_dir(&scenario.dir).expect("env");
    let stub = Arc::new(StubCommands::new().run_delay(Duration::from_secs(5)));
    let tools = toolbox(stub);
    let root = RunContext::background();
    let interrupt = root.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        interrupt.cancel();
    });
    let started = std::time::Instant::now();
    let summary = execute(
        &root,
        &default_catalog(DEFAULT_PHASE_TIMEOUT),
        &env,
        &tools,
        &ExecutionPlan::phases(["unit", "docs", "business"]),
    )
    .expect("execute");
    canceller.join().expect("canceller");
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());

    let statuses: Vec<PhaseStatus> = summary.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![PhaseStatus::Failed, PhaseStatus::Skipped, PhaseStatus::Skipped]
    );
    assert!(summary
        .results
        .iter()
        .all(|r| r.classification == Some(FailureClass::System)));
    for phase in ["unit", "docs", "business"] {
        let pointer = scenario.read_json(&format!("coverage/phase-results/{phase}.json"));
        assert_eq!(pointer["phase"], phase);
    }
    let written = scenario.read_json("coverage/phase-results/summary.json");
    assert_eq!(written["failed"], 1);
    assert_eq!(written["skipped"], 2);
}
