/// Group Evaluator: one group's condition and the reconciliation it implies.
///
/// Every call recomputes everything from live observations; nothing about a
/// previous pass affects the decisions.  The last seen condition per group is
/// remembered only so that transitions can be logged once.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::{Action, AppGroup, Condition};
use crate::error::{self, ProcessError, Severity};
use crate::launcher::{ActionOutcome, AppLauncher};
use crate::oracle::ProcessOracle;

/// Combines monitored-app states.  `All` over an empty list is *not* met.
pub fn condition_met(condition: Condition, states: &[bool]) -> bool {
    match condition {
        Condition::All => !states.is_empty() && states.iter().all(|&running| running),
        Condition::Any => states.iter().any(|&running| running),
    }
}

/// The condition after the group's optional inversion.
pub fn group_condition(group: &AppGroup, states: &[bool]) -> bool {
    condition_met(group.condition, states) != group.reverse
}

/// Whether a controlled app with `action` should be running.
pub fn desired_running(action: Action, condition_met: bool) -> bool {
    match action {
        Action::Start | Action::Sync => condition_met,
        Action::Stop | Action::Opposite => !condition_met,
    }
}

/// Everything one evaluation observed and did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub group: String,
    pub monitored: Vec<(String, bool)>,
    pub condition_met: bool,
    pub actions: Vec<(String, ActionOutcome)>,
}

impl GroupReport {
    pub fn changes(&self) -> usize {
        self.actions
            .iter()
            .filter(|(_, o)| matches!(o, ActionOutcome::Launched | ActionOutcome::Stopped))
            .count()
    }
}

pub struct GroupEvaluator {
    oracle: Arc<ProcessOracle>,
    launcher: AppLauncher,
    last_conditions: Mutex<HashMap<String, bool>>,
}

impl GroupEvaluator {
    pub fn new(oracle: Arc<ProcessOracle>, launcher: AppLauncher) -> Self {
        Self {
            oracle,
            launcher,
            last_conditions: Mutex::new(HashMap::new()),
        }
    }

    pub fn oracle(&self) -> &Arc<ProcessOracle> {
        &self.oracle
    }

    /// Evaluates `group` and reconciles each controlled app.  Never fails;
    /// a failing app is recorded in the report and the rest still run.
    pub async fn evaluate(&self, group: &AppGroup) -> GroupReport {
        let monitored = self.observe(group).await;
        let states: Vec<bool> = monitored.iter().map(|(_, running)| *running).collect();
        let met = group_condition(group, &states);
        self.note_condition(&group.name, met);

        let mut actions = Vec::with_capacity(group.controlled_apps.len());
        for app in &group.controlled_apps {
            let Some(name) = app.process_name() else {
                debug!(group = %group.name, "Controlled app without name or path skipped");
                actions.push((
                    String::new(),
                    ActionOutcome::Skipped("no process name or path configured".into()),
                ));
                continue;
            };

            let running = self.oracle.is_running(&name).await;
            let outcome = match (desired_running(app.action, met), running) {
                (true, false) => self.launcher.ensure_running(&app.path).await,
                (false, true) => self.launcher.stop(&name).await,
                _ => ActionOutcome::Unchanged,
            };
            if let ActionOutcome::Skipped(reason) | ActionOutcome::Failed(reason) = &outcome {
                debug!(group = %group.name, process = %name, reason, "Controlled app not reconciled");
            }
            actions.push((name, outcome));
        }

        GroupReport {
            group: group.name.clone(),
            monitored,
            condition_met: met,
            actions,
        }
    }

    /// Queries all monitored apps concurrently, preserving configuration order.
    async fn observe(&self, group: &AppGroup) -> Vec<(String, bool)> {
        let mut tasks = JoinSet::new();
        for (index, app) in group.monitored_apps.iter().enumerate() {
            let oracle = Arc::clone(&self.oracle);
            let name = app.name.clone();
            tasks.spawn(async move {
                let running = oracle.is_running(&name).await;
                (index, running)
            });
        }

        let mut states = vec![false; group.monitored_apps.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, running)) => states[index] = running,
                Err(e) => error::handle(
                    self.oracle.reporter().as_ref(),
                    &ProcessError::Task {
                        target: group.name.clone(),
                        details: e.to_string(),
                    },
                    &[("group", group.name.clone()), ("action", "query".into())],
                    Severity::Error,
                ),
            }
        }

        group
            .monitored_apps
            .iter()
            .zip(states)
            .map(|(app, running)| (app.name.clone(), running))
            .collect()
    }

    fn note_condition(&self, group: &str, met: bool) {
        let mut last = self
            .last_conditions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.insert(group.to_string(), met) {
            Some(previous) if previous != met => {
                info!(group, condition_met = met, "Group condition changed")
            }
            Some(_) => {}
            None => debug!(group, condition_met = met, "Group condition observed"),
        }
    }
}
