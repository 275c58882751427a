//! Calls into the `vrooli` lifecycle CLI.
//!
//! All invocations are captures under the caller's context; the CLI's output
//! formats are parsed here and nowhere else.
use crate::command::{args, Log};
use crate::context::RunContext;
use crate::toolbox::Toolbox;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const VROOLI: &str = "vrooli";

/// Subset of `vrooli scenario status <name> --json`.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ScenarioStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub diagnostics: StatusDiagnostics,
    #[serde(default)]
    pub insights: StatusInsights,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StatusDiagnostics {
    #[serde(default)]
    pub ui_smoke: Option<serde_json::Value>,
    #[serde(default)]
    pub health_checks: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StatusInsights {
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
    #[serde(default)]
    pub stack: Option<serde_json::Value>,
}

/// `vrooli resource status <name> --json`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceHealth {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub healthy: bool,
}

impl ResourceHealth {
    pub fn is_ready(self) -> bool {
        self.running && self.healthy
    }
}

pub fn scenario_status(
    ctx: &RunContext,
    tools: &Toolbox,
    dir: &Path,
    log: &mut Log,
    scenario: &str,
) -> Result<ScenarioStatus> {
    let stdout = tools.commands.capture(
        ctx,
        dir,
        log,
        VROOLI,
        &args(["scenario", "status", scenario, "--json"]),
    )?;
    serde_json::from_str(stdout.trim())
        .with_context(|| format!("parse vrooli scenario status for {scenario}"))
}

/// Resolve a named port for a scenario.
pub fn scenario_port(
    ctx: &RunContext,
    tools: &Toolbox,
    dir: &Path,
    log: &mut Log,
    scenario: &str,
    port_name: &str,
) -> Result<u16> {
    let stdout = tools.commands.capture(
        ctx,
        dir,
        log,
        VROOLI,
        &args(["scenario", "port", scenario, port_name]),
    )?;
    parse_port(&stdout).with_context(|| format!("resolve {port_name} for {scenario}"))
}

/// First contiguous run of digits in `text`.
///
/// The CLI sometimes prints labels around the number (`UI_PORT=38140`).
pub fn parse_port(text: &str) -> Result<u16> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty port output"));
    }
    let digits: String = trimmed
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return Err(anyhow!("no port number in {trimmed:?}"));
    }
    digits
        .parse::<u16>()
        .with_context(|| format!("port out of range: {digits}"))
}

pub fn start_scenario(
    ctx: &RunContext,
    tools: &Toolbox,
    dir: &Path,
    log: &mut Log,
    scenario: &str,
) -> Result<()> {
    tools
        .commands
        .capture(ctx, dir, log, VROOLI, &args(["scenario", "start", scenario]))
        .map(|_| ())
}

pub fn restart_scenario(
    ctx: &RunContext,
    tools: &Toolbox,
    dir: &Path,
    log: &mut Log,
    scenario: &str,
) -> Result<()> {
    tools
        .commands
        .capture(ctx, dir, log, VROOLI, &args(["scenario", "restart", scenario]))
        .map(|_| ())
}

pub fn resource_status(
    ctx: &RunContext,
    tools: &Toolbox,
    dir: &Path,
    log: &mut Log,
    resource: &str,
) -> Result<ResourceHealth> {
    let stdout = tools.commands.capture(
        ctx,
        dir,
        log,
        VROOLI,
        &args(["resource", "status", resource, "--json"]),
    )?;
    serde_json::from_str(stdout.trim())
        .with_context(|| format!("parse vrooli resource status for {resource}"))
}
