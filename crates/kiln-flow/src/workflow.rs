//! Workflow definitions consumed by trigger processing.
//!
//! A workflow is a set of steps. Steps without parents are created when the
//! workflow is triggered; every other step is created once all of its parents
//! have reached a terminal state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use kiln_core::{StepId, WorkflowId};

use crate::error::{Error, Result};

/// The concurrency policy applied to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyStrategyKind {
    /// Admit up to the bound, round-robin across key groups.
    GroupRoundRobin,
    /// Keep the newest tasks per key, cancelling older ones (including running ones).
    CancelInProgress,
    /// Keep running and oldest tasks per key, cancelling newer ones.
    CancelNewest,
}

impl ConcurrencyStrategyKind {
    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GroupRoundRobin => "GROUP_ROUND_ROBIN",
            Self::CancelInProgress => "CANCEL_IN_PROGRESS",
            Self::CancelNewest => "CANCEL_NEWEST",
        }
    }
}

/// One concurrency limit declared on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConcurrency {
    /// Key expression, e.g. `input.user_id`.
    pub expression: String,
    /// Maximum number of admitted tasks.
    pub max_concurrency: i32,
    /// Policy applied when the bound is reached.
    pub strategy: ConcurrencyStrategyKind,
}

/// Skips a step at creation when an input field equals a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipCondition {
    /// Field of the task input to compare.
    pub field: String,
    /// Value that causes the skip.
    pub equals: serde_json::Value,
}

impl SkipCondition {
    /// Returns true if the input matches the condition.
    #[must_use]
    pub fn matches(&self, input: &serde_json::Value) -> bool {
        input.get(&self.field) == Some(&self.equals)
    }
}

/// A step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step identifier.
    pub id: StepId,
    /// Human readable, unique within the workflow.
    pub readable_id: String,
    /// Queue tasks of this step are scheduled from.
    pub queue: String,
    /// Application-error retries.
    pub retries: i32,
    /// Readable ids of the steps this one waits for.
    pub parents: Vec<String>,
    /// Concurrency limits, evaluated in order.
    pub concurrency: Vec<StepConcurrency>,
    /// Seconds a task may wait in the queue.
    pub schedule_timeout_secs: i64,
    /// Seconds an attempt may run.
    pub step_timeout_secs: i64,
    /// Optional skip condition.
    pub skip_if: Option<SkipCondition>,
}

impl StepDefinition {
    /// Creates a step with no parents, retries or concurrency limits.
    #[must_use]
    pub fn new(readable_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: StepId::generate(),
            readable_id: readable_id.into(),
            queue: queue.into(),
            retries: 0,
            parents: Vec::new(),
            concurrency: Vec::new(),
            schedule_timeout_secs: 300,
            step_timeout_secs: 60,
            skip_if: None,
        }
    }

    /// Sets the application-error retry budget.
    #[must_use]
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Adds a parent step.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    /// Adds a concurrency limit.
    #[must_use]
    pub fn with_concurrency(
        mut self,
        expression: impl Into<String>,
        max_concurrency: i32,
        strategy: ConcurrencyStrategyKind,
    ) -> Self {
        self.concurrency.push(StepConcurrency {
            expression: expression.into(),
            max_concurrency,
            strategy,
        });
        self
    }

    /// Sets the schedule and step timeouts in seconds.
    #[must_use]
    pub fn with_timeouts(mut self, schedule_timeout_secs: i64, step_timeout_secs: i64) -> Self {
        self.schedule_timeout_secs = schedule_timeout_secs;
        self.step_timeout_secs = step_timeout_secs;
        self
    }

    /// Sets the skip condition.
    #[must_use]
    pub fn with_skip_if(mut self, field: impl Into<String>, equals: serde_json::Value) -> Self {
        self.skip_if = Some(SkipCondition {
            field: field.into(),
            equals,
        });
        self
    }

    /// Evaluates every concurrency key expression against the task input.
    ///
    /// # Errors
    ///
    /// Returns the message used as the initial-state reason when an
    /// expression cannot be evaluated.
    pub fn evaluate_concurrency_keys(
        &self,
        input: &serde_json::Value,
    ) -> std::result::Result<Vec<String>, String> {
        self.concurrency
            .iter()
            .map(|c| evaluate_key_expression(&c.expression, input))
            .collect()
    }
}

/// A workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier.
    pub id: WorkflowId,
    /// Name used by direct triggers.
    pub name: String,
    /// User event keys that trigger the workflow.
    pub event_triggers: Vec<String>,
    /// The steps.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::generate(),
            name: name.into(),
            event_triggers: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Adds a step.
    #[must_use]
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a user event trigger.
    #[must_use]
    pub fn on_event(mut self, key: impl Into<String>) -> Self {
        self.event_triggers.push(key.into());
        self
    }

    /// Returns true if triggering creates a DAG rather than a single task.
    #[must_use]
    pub fn is_dag(&self) -> bool {
        self.steps.len() > 1 || self.steps.iter().any(|s| !s.parents.is_empty())
    }

    /// Returns the steps created immediately on trigger.
    pub fn root_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|s| s.parents.is_empty())
    }

    /// Returns the steps that wait on parents.
    pub fn child_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|s| !s.parents.is_empty())
    }

    /// Looks up a step by readable id.
    #[must_use]
    pub fn step(&self, readable_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.readable_id == readable_id)
    }

    /// Checks that the workflow is well formed.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no steps, readable ids collide, a parent
    /// is unknown, or a concurrency bound is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(invalid(format!("workflow '{}' has no steps", self.name)));
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.readable_id.as_str()) {
                return Err(invalid(format!(
                    "workflow '{}' declares step '{}' twice",
                    self.name, step.readable_id
                )));
            }
        }

        for step in &self.steps {
            if let Some(parent) = step.parents.iter().find(|p| !seen.contains(p.as_str())) {
                return Err(invalid(format!(
                    "step '{}' depends on unknown step '{parent}'",
                    step.readable_id
                )));
            }
            if step.concurrency.iter().any(|c| c.max_concurrency <= 0) {
                return Err(invalid(format!(
                    "step '{}' has a non-positive concurrency bound",
                    step.readable_id
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::Core(kiln_core::Error::InvalidInput(message))
}

/// Evaluates an `input.<field>[.<field>...]` expression.
///
/// Strings are used verbatim; numbers and booleans use their JSON rendering.
///
/// # Errors
///
/// Returns a human readable reason if the expression is malformed or the
/// field is absent or not a scalar.
pub fn evaluate_key_expression(
    expression: &str,
    input: &serde_json::Value,
) -> std::result::Result<String, String> {
    let Some(path) = expression.trim().strip_prefix("input.") else {
        return Err(format!(
            "could not evaluate concurrency key expression '{expression}': must start with 'input.'"
        ));
    };

    let mut value = input;
    for segment in path.split('.') {
        value = value.get(segment).ok_or_else(|| {
            format!(
                "could not evaluate concurrency key expression '{expression}': \
                 field '{segment}' not found"
            )
        })?;
    }

    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(format!(
            "could not evaluate concurrency key expression '{expression}': value is not a scalar"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_expression_reads_nested_fields() {
        let input = json!({"user": {"id": 42}, "region": "eu"});
        assert_eq!(evaluate_key_expression("input.user.id", &input).unwrap(), "42");
        assert_eq!(evaluate_key_expression("input.region", &input).unwrap(), "eu");
    }

    #[test]
    fn key_expression_reports_missing_field() {
        let err = evaluate_key_expression("input.tenant", &json!({})).unwrap_err();
        assert!(err.contains("'tenant' not found"));
    }

    #[test]
    fn key_expression_rejects_non_input_paths() {
        assert!(evaluate_key_expression("additional_metadata.x", &json!({})).is_err());
        assert!(evaluate_key_expression("input.obj", &json!({"obj": {}})).is_err());
    }

    #[test]
    fn skip_condition_matches_equal_values() {
        let step = StepDefinition::new("a", "default").with_skip_if("dry_run", json!(true));
        let cond = step.skip_if.unwrap();
        assert!(cond.matches(&json!({"dry_run": true})));
        assert!(!cond.matches(&json!({"dry_run": false})));
        assert!(!cond.matches(&json!({})));
    }

    #[test]
    fn single_step_workflow_is_not_a_dag() {
        let wf = WorkflowDefinition::new("W").with_step(StepDefinition::new("only", "default"));
        assert!(!wf.is_dag());
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_parent() {
        let wf = WorkflowDefinition::new("W")
            .with_step(StepDefinition::new("a", "default"))
            .with_step(StepDefinition::new("b", "default").with_parent("missing"));
        assert!(wf.is_dag());
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_steps() {
        let wf = WorkflowDefinition::new("W")
            .with_step(StepDefinition::new("a", "default"))
            .with_step(StepDefinition::new("a", "default"));
        assert!(wf.validate().is_err());
    }
}
