//! Collaborators shared by every phase runner.
//!
//! Runners never reach for process-global state: subprocesses, environment
//! variables, the BAS client, the smoke driver and the isolation manager all
//! come from here, so tests swap any of them per run.
use crate::bas::{HttpWorkflowClient, WorkflowClient};
use crate::command::{CommandRunner, SystemCommands};
use crate::isolation::{DockerIsolation, IsolationManager};
use crate::phases::smoke::{HttpSmokeDriver, SmokeDriver};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Toolbox {
    pub commands: Arc<dyn CommandRunner>,
    pub workflows: Arc<dyn WorkflowClient>,
    pub smoke: Arc<dyn SmokeDriver>,
    pub isolation: Arc<dyn IsolationManager>,
    vars: BTreeMap<String, Option<String>>,
}

impl Toolbox {
    /// Real processes, real HTTP, real containers.
    pub fn system() -> Self {
        Self::with_commands(Arc::new(SystemCommands))
    }

    /// System collaborators around a caller-supplied command runner.
    pub fn with_commands(commands: Arc<dyn CommandRunner>) -> Self {
        Self {
            isolation: Arc::new(DockerIsolation::new(commands.clone())),
            commands,
            workflows: Arc::new(HttpWorkflowClient::default()),
            smoke: Arc::new(HttpSmokeDriver),
            vars: BTreeMap::new(),
        }
    }

    pub fn workflows(mut self, workflows: Arc<dyn WorkflowClient>) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn smoke(mut self, smoke: Arc<dyn SmokeDriver>) -> Self {
        self.smoke = smoke;
        self
    }

    pub fn isolation(mut self, isolation: Arc<dyn IsolationManager>) -> Self {
        self.isolation = isolation;
        self
    }

    /// Pin a variable for this toolbox without touching the process env.
    pub fn set_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), Some(value.to_string()));
        self
    }

    /// Hide a variable from this toolbox even if the process has it.
    pub fn unset_var(mut self, key: &str) -> Self {
        self.vars.insert(key.to_string(), None);
        self
    }

    /// Overrides first, then the process environment.
    pub fn var(&self, key: &str) -> Option<String> {
        match self.vars.get(key) {
            Some(value) => value.clone(),
            None => std::env::var(key).ok(),
        }
    }

    /// True for `1`, `true`, `yes`, `on` (any case).
    pub fn var_truthy(&self, key: &str) -> bool {
        self.var(key).is_some_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("vars", &self.vars)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_shadow_process_env() {
        let toolbox = Toolbox::system()
            .set_var("TEST_GENIE_SKIP_PLAYBOOKS", "Yes")
            .unset_var("PATH");
        assert!(toolbox.var_truthy("TEST_GENIE_SKIP_PLAYBOOKS"));
        assert!(toolbox.var("PATH").is_none());
        assert!(!toolbox.var_truthy("TEST_GENIE_TOOLBOX_UNSET_PROBE"));
    }
}
