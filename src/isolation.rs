//! Ephemeral resources and the seed lifecycle for playbook runs.
//!
//! A seed session provisions isolated Postgres/Redis instances, migrates and
//! seeds them, and restarts the scenario against them. Cleanup restarts the
//! scenario back onto its normal resources and releases the instances; it
//! runs at most once, on [`SeedSession::cleanup`] or on drop.
use crate::command::{args, CommandRunner, Log};
use crate::config::load_testing_config;
use crate::context::RunContext;
use crate::env_scope::ScopedEnv;
use crate::toolbox::Toolbox;
use crate::vrooli::restart_scenario;
use crate::workspace::{load_service_manifest_optional, Environment};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(500);
const POSTGRES_USER: &str = "test_genie";
const POSTGRES_DB: &str = "test_genie";

/// Resource kinds the isolation manager can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Postgres,
    Redis,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Postgres => "postgres",
            ResourceKind::Redis => "redis",
        }
    }

    fn image(self) -> &'static str {
        match self {
            ResourceKind::Postgres => "postgres:16-alpine",
            ResourceKind::Redis => "redis:7-alpine",
        }
    }

    fn container_port(self) -> &'static str {
        match self {
            ResourceKind::Postgres => "5432/tcp",
            ResourceKind::Redis => "6379/tcp",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instances provisioned for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub run_id: String,
    /// Variables scenario processes need to reach the instances.
    pub env: BTreeMap<String, String>,
    /// Manager-specific handles, e.g. container names.
    pub handles: Vec<String>,
}

/// Provisions and releases ephemeral resources.
pub trait IsolationManager: Send + Sync {
    fn allocate(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        scenario: &str,
        resources: &[ResourceKind],
    ) -> Result<Allocation>;

    fn release(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        allocation: &Allocation,
    ) -> Result<()>;
}

/// Containers through the docker CLI.
#[derive(Clone)]
pub struct DockerIsolation {
    commands: Arc<dyn CommandRunner>,
}

impl DockerIsolation {
    pub fn new(commands: Arc<dyn CommandRunner>) -> Self {
        Self { commands }
    }

    fn start(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        run_id: &str,
        kind: ResourceKind,
    ) -> Result<(String, u16)> {
        let name = format!("test-genie-{run_id}-{kind}");
        let mut docker_args = args(["run", "-d", "--rm", "-P", "--name", name.as_str()]);
        if kind == ResourceKind::Postgres {
            docker_args.extend(args([
                "-e".to_string(),
                format!("POSTGRES_USER={POSTGRES_USER}"),
                "-e".to_string(),
                format!("POSTGRES_PASSWORD={run_id}"),
                "-e".to_string(),
                format!("POSTGRES_DB={POSTGRES_DB}"),
            ]));
        }
        docker_args.push(kind.image().to_string());
        self.commands
            .capture(ctx, dir, log, "docker", &docker_args)
            .with_context(|| format!("start {kind} container"))?;

        let port_out = self
            .commands
            .capture(
                ctx,
                dir,
                log,
                "docker",
                &args(["port", name.as_str(), kind.container_port()]),
            )
            .with_context(|| format!("discover {kind} port"))?;
        let port = parse_docker_port(&port_out)?;
        Ok((name, port))
    }

    fn wait_ready(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        name: &str,
        kind: ResourceKind,
    ) -> Result<()> {
        let probe = match kind {
            ResourceKind::Postgres => args(["exec", name, "pg_isready", "-U", POSTGRES_USER]),
            ResourceKind::Redis => args(["exec", name, "redis-cli", "ping"]),
        };
        let ready_ctx = ctx.with_timeout(READY_TIMEOUT);
        loop {
            if let Ok(out) = self.commands.capture(&ready_ctx, dir, log, "docker", &probe) {
                if kind != ResourceKind::Redis || out.trim().eq_ignore_ascii_case("PONG") {
                    return Ok(());
                }
            }
            ready_ctx
                .sleep(READY_POLL)
                .with_context(|| format!("{kind} container {name} never became ready"))?;
        }
    }
}

impl fmt::Debug for DockerIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerIsolation").finish_non_exhaustive()
    }
}

impl IsolationManager for DockerIsolation {
    fn allocate(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        scenario: &str,
        resources: &[ResourceKind],
    ) -> Result<Allocation> {
        let mut allocation = Allocation {
            run_id: new_run_id(),
            ..Allocation::default()
        };
        allocation
            .env
            .insert("TEST_GENIE_RUN_ID".to_string(), allocation.run_id.clone());
        tracing::info!(scenario, run_id = allocation.run_id.as_str(), "allocating isolated resources");

        for &kind in resources {
            let started = self
                .start(ctx, dir, log, &allocation.run_id, kind)
                .and_then(|(name, port)| {
                    allocation.handles.push(name.clone());
                    self.wait_ready(ctx, dir, log, &name, kind)?;
                    Ok(port)
                });
            let port = match started {
                Ok(port) => port,
                Err(err) => {
                    // A container that failed to start may still exist.
                    let name = format!("test-genie-{}-{kind}", allocation.run_id);
                    if !allocation.handles.contains(&name) {
                        allocation.handles.push(name);
                    }
                    let cleanup_ctx = RunContext::background().with_timeout(CLEANUP_TIMEOUT);
                    if let Err(release_err) = self.release(&cleanup_ctx, dir, log, &allocation) {
                        tracing::warn!(error = %format!("{release_err:#}"), "partial allocation cleanup failed");
                    }
                    return Err(err);
                }
            };
            export_env(&mut allocation.env, kind, port, &allocation.run_id);
        }
        Ok(allocation)
    }

    fn release(
        &self,
        ctx: &RunContext,
        dir: &Path,
        log: &mut Log,
        allocation: &Allocation,
    ) -> Result<()> {
        if allocation.handles.is_empty() {
            return Ok(());
        }
        let mut rm = args(["rm", "-f"]);
        rm.extend(allocation.handles.iter().cloned());
        self.commands
            .capture(ctx, dir, log, "docker", &rm)
            .map(|_| ())
            .with_context(|| format!("release isolated resources for run {}", allocation.run_id))
    }
}

fn export_env(env: &mut BTreeMap<String, String>, kind: ResourceKind, port: u16, run_id: &str) {
    let host = "127.0.0.1";
    match kind {
        ResourceKind::Postgres => {
            env.insert(
                "DATABASE_URL".to_string(),
                format!("postgres://{POSTGRES_USER}:{run_id}@{host}:{port}/{POSTGRES_DB}?sslmode=disable"),
            );
            env.insert("POSTGRES_HOST".to_string(), host.to_string());
            env.insert("POSTGRES_PORT".to_string(), port.to_string());
            env.insert("POSTGRES_USER".to_string(), POSTGRES_USER.to_string());
            env.insert("POSTGRES_PASSWORD".to_string(), run_id.to_string());
            env.insert("POSTGRES_DB".to_string(), POSTGRES_DB.to_string());
        }
        ResourceKind::Redis => {
            env.insert("REDIS_URL".to_string(), format!("redis://{host}:{port}/0"));
            env.insert("REDIS_HOST".to_string(), host.to_string());
            env.insert("REDIS_PORT".to_string(), port.to_string());
        }
    }
}

/// Host port from `docker port` output (`0.0.0.0:49153`, `[::]:49153`).
pub fn parse_docker_port(output: &str) -> Result<u16> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("docker port printed nothing"))?;
    let port = line.rsplit(':').next().unwrap_or(line);
    port.parse::<u16>()
        .with_context(|| format!("parse docker port mapping {line:?}"))
}

fn new_run_id() -> String {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{:x}{:04x}", (nanos / 1_000_000) as u64, std::process::id() & 0xffff)
}

/// JSON written by the seed script.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedState {
    pub path: PathBuf,
    pub data: Value,
}

pub fn read_seed_state(path: &Path) -> Result<Option<SeedState>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let data = serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(SeedState {
        path: path.to_path_buf(),
        data,
    }))
}

/// Isolated resources bound to one playbooks run.
pub struct SeedSession {
    pub run_id: String,
    pub env: BTreeMap<String, String>,
    pub seed_state: Option<SeedState>,
    guard: Option<CleanupGuard>,
}

struct CleanupGuard {
    tools: Toolbox,
    dir: PathBuf,
    scenario: String,
    allocation: Allocation,
    restarted: bool,
    retain: bool,
}

impl CleanupGuard {
    fn run(self, log: &mut Log) -> Result<()> {
        let ctx = RunContext::background().with_timeout(CLEANUP_TIMEOUT);
        let mut first_err = None;
        if self.restarted {
            if let Err(err) = restart_scenario(&ctx, &self.tools, &self.dir, log, &self.scenario) {
                let _ = writeln!(log, "restart of {} after seeding failed: {err:#}", self.scenario);
                first_err = Some(err.context("restart scenario onto normal resources"));
            }
        }
        if self.retain {
            let _ = writeln!(
                log,
                "retaining isolated resources for run {} ({})",
                self.allocation.run_id,
                self.allocation.handles.join(", ")
            );
            tracing::info!(run_id = self.allocation.run_id.as_str(), "retaining isolated resources");
        } else if let Err(err) = self.tools.isolation.release(&ctx, &self.dir, log, &self.allocation) {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SeedSession {
    /// Restart onto normal resources, then release. Later calls are no-ops.
    pub fn cleanup(&mut self, log: &mut Log) -> Result<()> {
        match self.guard.take() {
            Some(guard) => guard.run(log),
            None => Ok(()),
        }
    }

    pub fn seed_state_value(&self) -> Option<&Value> {
        self.seed_state.as_ref().map(|state| &state.data)
    }
}

impl Drop for SeedSession {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup(&mut std::io::sink()) {
            tracing::warn!(run_id = self.run_id.as_str(), error = %format!("{err:#}"), "seed session cleanup failed");
        }
    }
}

impl fmt::Debug for SeedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedSession")
            .field("run_id", &self.run_id)
            .field("env", &self.env)
            .field("seed_state", &self.seed_state)
            .field("active", &self.guard.is_some())
            .finish()
    }
}

/// Resources the scenario declares, or both when it declares neither.
pub fn resources_for(env: &Environment, log: &mut Log) -> Result<Vec<ResourceKind>> {
    let manifest = load_service_manifest_optional(&env.scenario_dir)?;
    let mut kinds = Vec::new();
    if let Some(manifest) = &manifest {
        if manifest.declares_resource("postgres") {
            kinds.push(ResourceKind::Postgres);
        }
        if manifest.declares_resource("redis") {
            kinds.push(ResourceKind::Redis);
        }
    }
    if kinds.is_empty() {
        let _ = writeln!(
            log,
            "⚠️ service.json declares neither postgres nor redis; provisioning both"
        );
        tracing::warn!(scenario = env.scenario_name.as_str(), "no isolatable resources declared; provisioning both");
        kinds = vec![ResourceKind::Postgres, ResourceKind::Redis];
    }
    Ok(kinds)
}

fn migration_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Provision, migrate and seed isolated resources for the playbooks phase.
///
/// Any failure unwinds what was already done: the process environment is
/// restored and the allocation released before the error returns.
pub fn apply_playbooks_seed(
    ctx: &RunContext,
    env: &Environment,
    tools: &Toolbox,
    log: &mut Log,
    retain: bool,
) -> Result<SeedSession> {
    let config = load_testing_config(&env.scenario_dir)?;
    let seeds = config.playbooks.seeds;
    if !seeds.enabled {
        bail!("playbook seeds are disabled in .vrooli/testing.json");
    }
    let retain = retain || seeds.retain;
    let paths = env.paths();
    let resources = resources_for(env, log)?;
    let migrations = if resources.contains(&ResourceKind::Postgres) {
        migration_files(&paths.migrations_dir())?
    } else {
        Vec::new()
    };
    if !migrations.is_empty() {
        tools.commands.lookup("psql")?;
    }
    ctx.check()?;

    let allocation = tools.isolation.allocate(
        ctx,
        &env.scenario_dir,
        log,
        &env.scenario_name,
        &resources,
    )?;
    let mut session = SeedSession {
        run_id: allocation.run_id.clone(),
        env: allocation.env.clone(),
        seed_state: None,
        guard: Some(CleanupGuard {
            tools: tools.clone(),
            dir: env.scenario_dir.clone(),
            scenario: env.scenario_name.clone(),
            allocation,
            restarted: false,
            retain,
        }),
    };
    let _ = writeln!(log, "🌱 isolated run {} ({} resource(s))", session.run_id, resources.len());

    {
        let mut scope = ScopedEnv::apply(&session.env);
        if let Some(database_url) = session.env.get("DATABASE_URL") {
            for file in &migrations {
                let file_arg = file.display().to_string();
                tools
                    .commands
                    .run(
                        ctx,
                        &env.scenario_dir,
                        log,
                        "psql",
                        &args(["-v", "ON_ERROR_STOP=1", "-d", database_url.as_str(), "-f", file_arg.as_str()]),
                    )
                    .with_context(|| format!("apply migration {}", file.display()))?;
            }
        }
        restart_scenario(ctx, tools, &env.scenario_dir, log, &env.scenario_name)
            .context("restart scenario onto isolated resources")?;
        if let Some(guard) = session.guard.as_mut() {
            guard.restarted = true;
        }
        scope.restore();
    }

    let seed_script = paths.seeds_dir().join("apply.sh");
    let state_path = paths.seed_state_path();
    if seed_script.is_file() {
        let mut seed_env = session.env.clone();
        seed_env.insert(
            "TEST_GENIE_SEED_STATE_PATH".to_string(),
            state_path.display().to_string(),
        );
        let seed_ctx = ctx.with_timeout(seeds.timeout());
        let mut scope = ScopedEnv::apply(&seed_env);
        let script_arg = seed_script.display().to_string();
        let applied = tools
            .commands
            .run(&seed_ctx, &env.scenario_dir, log, "bash", &args([script_arg]));
        scope.restore();
        applied.with_context(|| format!("apply seeds from {}", seed_script.display()))?;
    }
    session.seed_state = read_seed_state(&state_path)?;
    Ok(session)
}
