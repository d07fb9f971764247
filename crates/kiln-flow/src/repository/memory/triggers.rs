//! Task creation from triggers and satisfied match conditions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kiln_core::{DagExternalId, ExternalId, TenantId};

use super::{DagRecord, InMemoryRepository, MatchCondition, RegisteredWorkflow, State, poison_err};
use crate::error::Result;
use crate::events::{TaskOutcome, parse_task_event_key};
use crate::repository::{
    CandidateEventMatch, EventTriggerOpts, MatchRepository, MatchResult, TriggerRepository,
    TriggerResult, WorkflowNameTriggerOpts,
};
use crate::task::{Dag, DagId, DagWithData, InitialState, Task, TaskId, TaskState};
use crate::workflow::StepDefinition;

/// Everything needed to insert one task.
struct NewTask {
    external_id: ExternalId,
    display_name: String,
    dag: Option<(DagId, DateTime<Utc>)>,
    input: serde_json::Value,
    additional_metadata: BTreeMap<String, String>,
    parent_task_id: Option<TaskId>,
    child_index: Option<i64>,
    child_key: Option<String>,
    forced_state: Option<(InitialState, String)>,
}

/// Decides the state a task is created in.
fn initial_state(
    step: &StepDefinition,
    input: &serde_json::Value,
) -> (InitialState, Option<String>, Vec<String>) {
    if step.skip_if.as_ref().is_some_and(|skip| skip.matches(input)) {
        return (InitialState::Skipped, None, Vec::new());
    }
    match step.evaluate_concurrency_keys(input) {
        Ok(keys) => (InitialState::Queued, None, keys),
        Err(reason) => (InitialState::Failed, Some(reason), Vec::new()),
    }
}

fn insert_task(
    state: &mut State,
    tenant_id: TenantId,
    workflow: &RegisteredWorkflow,
    step: &StepDefinition,
    new: NewTask,
    now: DateTime<Utc>,
) -> Task {
    let (initial, reason, keys) = match new.forced_state {
        Some((initial, reason)) => (initial, Some(reason), Vec::new()),
        None => initial_state(step, &new.input),
    };
    let queued = initial == InitialState::Queued;
    let strategy_ids = if queued {
        workflow
            .strategies
            .get(&step.readable_id)
            .cloned()
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    state.next_task_id += 1;
    let mut task = Task {
        id: state.next_task_id,
        inserted_at: now,
        tenant_id,
        external_id: new.external_id,
        queue: step.queue.clone(),
        step_id: step.id,
        step_readable_id: step.readable_id.clone(),
        workflow_id: workflow.definition.id,
        display_name: new.display_name,
        dag_id: new.dag.map(|(id, _)| id),
        dag_inserted_at: new.dag.map(|(_, at)| at),
        input: new.input,
        additional_metadata: new.additional_metadata,
        retry_count: 0,
        internal_retry_count: 0,
        retries: step.retries,
        state: TaskState::from(initial),
        initial_state: initial,
        initial_state_reason: reason,
        desired_worker_id: None,
        worker_id: None,
        concurrency_keys: keys,
        concurrency_strategy_ids: strategy_ids,
        schedule_timeout_secs: step.schedule_timeout_secs,
        step_timeout_secs: step.step_timeout_secs,
        schedule_timeout_at: None,
        timeout_at: None,
        parent_task_id: new.parent_task_id,
        child_index: new.child_index,
        child_key: new.child_key,
    };
    if queued {
        task.schedule_timeout_at = Some(now + task.schedule_timeout());
    }

    state.tasks_by_external_id.insert(task.external_id, task.id);
    state.tasks.insert(task.id, task.clone());
    if queued {
        state.enqueue(task.id);
    }
    task
}

/// Creates a run of `workflow`: a standalone task, or a DAG with its root
/// tasks and a match condition per child step.
fn trigger_workflow(
    state: &mut State,
    tenant_id: TenantId,
    workflow: &RegisteredWorkflow,
    opts: &WorkflowNameTriggerOpts,
    now: DateTime<Utc>,
    result: &mut TriggerResult,
) {
    let definition = &workflow.definition;
    let dag_external_id = DagExternalId::from_uuid(opts.external_id.as_uuid());
    if state.tasks_by_external_id.contains_key(&opts.external_id)
        || state.dags_by_external_id.contains_key(&dag_external_id)
    {
        tracing::debug!(external_id = %opts.external_id, "run already exists, skipping trigger");
        return;
    }

    if !definition.is_dag() {
        let Some(step) = definition.steps.first() else {
            return;
        };
        let task = insert_task(
            state,
            tenant_id,
            workflow,
            step,
            NewTask {
                external_id: opts.external_id,
                display_name: definition.name.clone(),
                dag: None,
                input: opts.data.clone(),
                additional_metadata: opts.additional_metadata.clone(),
                parent_task_id: opts.parent_task_id,
                child_index: opts.child_index,
                child_key: opts.child_key.clone(),
                forced_state: None,
            },
            now,
        );
        result.tasks.push(task);
        return;
    }

    state.next_dag_id += 1;
    let dag = DagWithData {
        dag: Dag {
            id: state.next_dag_id,
            inserted_at: now,
            tenant_id,
            external_id: dag_external_id,
            workflow_id: definition.id,
            display_name: definition.name.clone(),
        },
        input: opts.data.clone(),
        additional_metadata: opts.additional_metadata.clone(),
        total_tasks: definition.steps.len(),
    };
    state.dags_by_external_id.insert(dag_external_id, dag.dag.id);
    state.dags.insert(
        dag.dag.id,
        DagRecord {
            dag: dag.clone(),
            workflow_name: definition.name.clone(),
        },
    );

    for step in definition.root_steps() {
        let task = insert_task(
            state,
            tenant_id,
            workflow,
            step,
            NewTask {
                external_id: ExternalId::generate(),
                display_name: format!("{}/{}", definition.name, step.readable_id),
                dag: Some((dag.dag.id, now)),
                input: opts.data.clone(),
                additional_metadata: opts.additional_metadata.clone(),
                parent_task_id: opts.parent_task_id,
                child_index: opts.child_index,
                child_key: opts.child_key.clone(),
                forced_state: None,
            },
            now,
        );
        result.tasks.push(task);
    }
    for step in definition.child_steps() {
        state.matches.push(MatchCondition {
            tenant_id,
            dag_id: dag.dag.id,
            step_readable_id: step.readable_id.clone(),
            parents: step.parents.clone(),
            outcomes: BTreeMap::new(),
        });
    }
    result.dags.push(dag);
}

/// Input of a DAG child: the run input plus the outputs of its parents.
fn child_input(
    run_input: &serde_json::Value,
    parents: serde_json::Map<String,
    serde_json::Value>,
) -> serde_json::Value {
    match run_input {
        serde_json::Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert("parents".to_string(), serde_json::Value::Object(parents));
            serde_json::Value::Object(fields)
        }
        other => serde_json::json!({ "input": other, "parents": parents }),
    }
}

#[async_trait]
impl TriggerRepository for InMemoryRepository {
    async fn trigger_from_events(
        &self,
        tenant_id: TenantId,
        opts: &[EventTriggerOpts],
    ) -> Result<TriggerResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.require_partition(now)?;

        let mut result = TriggerResult::default();
        for event in opts {
            let matching: Vec<RegisteredWorkflow> = state
                .workflows
                .get(&tenant_id)
                .map(|workflows| {
                    workflows
                        .values()
                        .filter(|w| w.definition.event_triggers.contains(&event.key))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for workflow in &matching {
                let trigger = WorkflowNameTriggerOpts {
                    external_id: ExternalId::generate(),
                    workflow_name: workflow.definition.name.clone(),
                    data: event.data.clone(),
                    additional_metadata: event.additional_metadata.clone(),
                    parent_task_id: None,
                    child_index: None,
                    child_key: None,
                };
                trigger_workflow(&mut state, tenant_id, workflow, &trigger, now, &mut result);
            }
        }
        drop(state);
        Ok(result)
    }

    async fn trigger_from_workflow_names(
        &self,
        tenant_id: TenantId,
        opts: &[WorkflowNameTriggerOpts],
    ) -> Result<TriggerResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.require_partition(now)?;

        let mut result = TriggerResult::default();
        for trigger in opts {
            let Some(workflow) = state.workflow(tenant_id, &trigger.workflow_name).cloned() else {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    workflow = %trigger.workflow_name,
                    "workflow not found, skipping trigger"
                );
                continue;
            };

            let child = trigger
                .parent_task_id
                .zip(trigger.child_index)
                .map(|(parent, index)| (parent, index, trigger.child_key.clone()));
            if let Some(child) = &child {
                if state.children.contains(child) {
                    tracing::debug!(
                        parent_task_id = child.0,
                        child_index = child.1,
                        "child already spawned"
                    );
                    continue;
                }
            }

            trigger_workflow(&mut state, tenant_id, &workflow, trigger, now, &mut result);
            if let Some(child) = child {
                state.children.insert(child);
            }
        }
        drop(state);
        Ok(result)
    }
}

#[async_trait]
impl MatchRepository for InMemoryRepository {
    async fn process_internal_event_matches(
        &self,
        tenant_id: TenantId,
        events: &[CandidateEventMatch],
    ) -> Result<MatchResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        state.require_partition(now)?;

        for event in events {
            let Some((outcome, external_id)) = parse_task_event_key(&event.key) else {
                continue;
            };
            let Some(parent) = state
                .tasks_by_external_id
                .get(&external_id)
                .and_then(|id| state.tenant_task(tenant_id, *id))
            else {
                continue;
            };
            let Some(dag_id) = parent.dag_id else {
                continue;
            };
            let step = parent.step_readable_id.clone();
            let output = match outcome {
                TaskOutcome::Completed => event
                    .data
                    .get("output")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                TaskOutcome::Failed | TaskOutcome::Cancelled => serde_json::Value::Null,
            };
            for condition in state.matches.iter_mut().filter(|c| {
                c.tenant_id == tenant_id && c.dag_id == dag_id && c.parents.contains(&step)
            }) {
                condition
                    .outcomes
                    .insert(step.clone(), (outcome, output.clone()));
            }
        }

        let (ready, waiting): (Vec<MatchCondition>, Vec<MatchCondition>) =
            std::mem::take(&mut state.matches)
                .into_iter()
                .partition(|c| c.tenant_id == tenant_id && c.is_satisfied());
        state.matches = waiting;

        let mut result = MatchResult::default();
        for condition in ready {
            let Some(record) = state.dags.get(&condition.dag_id).cloned() else {
                continue;
            };
            let Some(workflow) = state.workflow(tenant_id, &record.workflow_name).cloned() else {
                tracing::warn!(dag_id = condition.dag_id, "workflow of run no longer registered");
                continue;
            };
            let Some(step) = workflow.definition.step(&condition.step_readable_id).cloned() else {
                continue;
            };

            let blocked_by = condition
                .outcomes
                .iter()
                .find(|(_, (outcome, _))| *outcome != TaskOutcome::Completed)
                .map(|(parent, _)| parent.clone());
            let parents = condition
                .outcomes
                .into_iter()
                .map(|(parent, (_, output))| (parent, output))
                .collect();

            let task = insert_task(
                &mut state,
                tenant_id,
                &workflow,
                &step,
                NewTask {
                    external_id: ExternalId::generate(),
                    display_name: format!("{}/{}", workflow.definition.name, step.readable_id),
                    dag: Some((record.dag.dag.id, record.dag.dag.inserted_at)),
                    input: child_input(&record.dag.input, parents),
                    additional_metadata: record.dag.additional_metadata.clone(),
                    parent_task_id: None,
                    child_index: None,
                    child_key: None,
                    forced_state: blocked_by.map(|parent| {
                        (
                            InitialState::Cancelled,
                            format!("parent step '{parent}' did not complete"),
                        )
                    }),
                },
                now,
            );
            result.created_tasks.push(task);
        }
        drop(state);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::events::{CompletedData, TaskOutcome};
    use crate::repository::TaskRepository;
    use crate::workflow::{ConcurrencyStrategyKind, WorkflowDefinition};

    async fn repo_with(workflows: Vec<WorkflowDefinition>) -> (InMemoryRepository, TenantId) {
        let repo = InMemoryRepository::new();
        let tenant = TenantId::generate();
        repo.register_tenant(tenant, None).unwrap();
        for workflow in workflows {
            repo.register_workflow(tenant, workflow).unwrap();
        }
        repo.update_table_partitions(Utc::now()).await.unwrap();
        (repo, tenant)
    }

    fn by_name(name: &str, data: serde_json::Value) -> WorkflowNameTriggerOpts {
        WorkflowNameTriggerOpts {
            external_id: ExternalId::generate(),
            workflow_name: name.to_string(),
            data,
            additional_metadata: BTreeMap::new(),
            parent_task_id: None,
            child_index: None,
            child_key: None,
        }
    }

    fn completed(task: &Task, output: serde_json::Value) -> CandidateEventMatch {
        CandidateEventMatch {
            id: Uuid::new_v4(),
            event_timestamp: Utc::now(),
            key: TaskOutcome::Completed.event_key(&task.external_id),
            data: serde_json::to_value(CompletedData {
                step_readable_id: task.step_readable_id.clone(),
                output,
            })
            .unwrap(),
        }
    }

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new("diamond")
            .with_step(StepDefinition::new("a", "default"))
            .with_step(StepDefinition::new("b", "default").with_parent("a"))
            .with_step(StepDefinition::new("c", "default").with_parent("a"))
            .with_step(
                StepDefinition::new("d", "default")
                    .with_parent("b")
                    .with_parent("c"),
            )
    }

    #[tokio::test]
    async fn writes_require_a_partition() {
        let repo = InMemoryRepository::new();
        let tenant = TenantId::generate();
        repo.register_workflow(
            tenant,
            WorkflowDefinition::new("w").with_step(StepDefinition::new("s", "q")),
        )
        .unwrap();
        let err = repo
            .trigger_from_workflow_names(tenant, &[by_name("w", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::PartitionMissing { .. }));
    }

    #[tokio::test]
    async fn single_step_workflow_creates_one_queued_task() {
        let (repo, tenant) =
            repo_with(vec![WorkflowDefinition::new("w").with_step(StepDefinition::new("s", "q"))])
                .await;
        let opts = by_name("w", json!({"n": 1}));
        let result = repo.trigger_from_workflow_names(tenant, &[opts.clone()]).await.unwrap();
        assert_eq!(result.tasks.len(), 1);
        assert!(result.dags.is_empty());
        assert_eq!(result.tasks[0].state, TaskState::Queued);
        assert_eq!(result.tasks[0].external_id, opts.external_id);

        // Re-delivery of the same trigger is idempotent.
        let again = repo.trigger_from_workflow_names(tenant, &[opts]).await.unwrap();
        assert!(again.tasks.is_empty());

        let missing = repo
            .trigger_from_workflow_names(tenant, &[by_name("nope", json!({}))])
            .await
            .unwrap();
        assert!(missing.tasks.is_empty());
    }

    #[tokio::test]
    async fn initial_state_follows_skip_and_key_evaluation() {
        let workflow = WorkflowDefinition::new("w").with_step(
            StepDefinition::new("s", "q")
                .with_skip_if("skip", json!(true))
                .with_concurrency("input.user", 1, ConcurrencyStrategyKind::GroupRoundRobin),
        );
        let (repo, tenant) = repo_with(vec![workflow]).await;

        let result = repo
            .trigger_from_workflow_names(
                tenant,
                &[
                    by_name("w", json!({"skip": true})),
                    by_name("w", json!({})),
                    by_name("w", json!({"user": "u1"})),
                ],
            )
            .await
            .unwrap();
        let states: Vec<_> = result.tasks.iter().map(|t| t.initial_state).collect();
        assert_eq!(
            states,
            vec![InitialState::Skipped, InitialState::Failed, InitialState::Queued]
        );
        assert!(result.tasks[1]
            .initial_state_reason
            .as_deref()
            .unwrap()
            .contains("could not evaluate"));
        assert_eq!(result.tasks[2].concurrency_keys, vec!["u1".to_string()]);
        assert_eq!(result.tasks[2].concurrency_strategy_ids.len(), 1);
        // Limited tasks wait in their strategy, not in the queue.
        assert!(repo.queue_items(tenant).unwrap().is_empty());
        assert_eq!(repo.slots(result.tasks[2].concurrency_strategy_ids[0]).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn child_spawns_are_deduplicated() {
        let (repo, tenant) =
            repo_with(vec![WorkflowDefinition::new("w").with_step(StepDefinition::new("s", "q"))])
                .await;
        let spawn = |key: Option<&str>| WorkflowNameTriggerOpts {
            parent_task_id: Some(7),
            child_index: Some(0),
            child_key: key.map(str::to_string),
            ..by_name("w", json!({}))
        };
        let first = repo.trigger_from_workflow_names(tenant, &[spawn(Some("k"))]).await.unwrap();
        assert_eq!(first.tasks.len(), 1);
        assert_eq!(first.tasks[0].parent_task_id, Some(7));

        let dup = repo.trigger_from_workflow_names(tenant, &[spawn(Some("k"))]).await.unwrap();
        assert!(dup.tasks.is_empty());

        let other_key = repo.trigger_from_workflow_names(tenant, &[spawn(None)]).await.unwrap();
        assert_eq!(other_key.tasks.len(), 1);
    }

    #[tokio::test]
    async fn user_events_trigger_subscribed_workflows() {
        let (repo, tenant) = repo_with(vec![
            WorkflowDefinition::new("on-order")
                .on_event("order.created")
                .with_step(StepDefinition::new("s", "q")),
            WorkflowDefinition::new("other")
                .on_event("order.deleted")
                .with_step(StepDefinition::new("s", "q")),
        ])
        .await;
        let result = repo
            .trigger_from_events(
                tenant,
                &[EventTriggerOpts {
                    event_id: Uuid::new_v4(),
                    key: "order.created".into(),
                    data: json!({"order": 1}),
                    additional_metadata: BTreeMap::from([("source".into(), "api".into())]),
                }],
            )
            .await
            .unwrap();
        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].input, json!({"order": 1}));
        assert_eq!(result.tasks[0].additional_metadata["source"], "api");
    }

    #[tokio::test]
    async fn dag_children_wait_for_all_parents() {
        let (repo, tenant) = repo_with(vec![diamond()]).await;
        let result = repo
            .trigger_from_workflow_names(tenant, &[by_name("diamond", json!({"x": 1}))])
            .await
            .unwrap();
        assert_eq!(result.dags.len(), 1);
        assert_eq!(result.dags[0].total_tasks, 4);
        assert_eq!(result.tasks.len(), 1);
        let a = &result.tasks[0];

        let created = repo
            .process_internal_event_matches(tenant, &[completed(a, json!({"a": "done"}))])
            .await
            .unwrap()
            .created_tasks;
        let mut steps: Vec<_> = created.iter().map(|t| t.step_readable_id.as_str()).collect();
        steps.sort_unstable();
        assert_eq!(steps, vec!["b", "c"]);
        assert_eq!(created[0].input["parents"]["a"], json!({"a": "done"}));
        assert_eq!(created[0].input["x"], json!(1));

        let b = created.iter().find(|t| t.step_readable_id == "b").unwrap();
        let c = created.iter().find(|t| t.step_readable_id == "c").unwrap();
        let only_b = repo
            .process_internal_event_matches(tenant, &[completed(b, json!(1))])
            .await
            .unwrap();
        assert!(only_b.created_tasks.is_empty());

        let d = repo
            .process_internal_event_matches(tenant, &[completed(c, json!(2))])
            .await
            .unwrap()
            .created_tasks;
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].initial_state, InitialState::Queued);
        assert_eq!(repo.dag_tasks(result.dags[0].dag.id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn failed_parent_cancels_children() {
        let (repo, tenant) = repo_with(vec![diamond()]).await;
        let result = repo
            .trigger_from_workflow_names(tenant, &[by_name("diamond", json!({}))])
            .await
            .unwrap();
        let a = &result.tasks[0];
        repo.cancel_tasks(tenant, &[a.attempt()]).await.unwrap();

        let event = CandidateEventMatch {
            id: Uuid::new_v4(),
            event_timestamp: Utc::now(),
            key: TaskOutcome::Failed.event_key(&a.external_id),
            data: json!({"error": "boom"}),
        };
        let created = repo
            .process_internal_event_matches(tenant, &[event])
            .await
            .unwrap()
            .created_tasks;
        assert_eq!(created.len(), 2);
        assert!(
            created
                .iter()
                .all(|t| t.initial_state == InitialState::Cancelled
                    && t.state == TaskState::Cancelled)
        );
    }
}
