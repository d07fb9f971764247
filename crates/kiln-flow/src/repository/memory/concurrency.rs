//! Concurrency strategy evaluation under the advisory lock.

use async_trait::async_trait;

use kiln_core::TenantId;

use super::{InMemoryRepository, QueueItem, State, poison_err};
use crate::concurrency::strategy::{
    SlotCandidate, StrategyAction, StrategyDecision, evaluate, fold_decisions,
};
use crate::error::Result;
use crate::repository::{ConcurrencyRepository, ConcurrencyStrategy, RunConcurrencyResult};
use crate::task::StrategyId;

/// Drops slots whose attempt is no longer the active one.
fn prune_stale_slots(state: &mut State, strategy_id: StrategyId) {
    let stale: Vec<_> = state
        .slots
        .iter()
        .filter(|((id, _), slot)| {
            *id == strategy_id
                && !state
                    .tasks
                    .get(&slot.task.id)
                    .is_some_and(|task| task.accepts(slot.task))
        })
        .map(|(key, _)| *key)
        .collect();
    for key in stale {
        state.slots.remove(&key);
    }
}

fn apply(state: &mut State, strategy_id: StrategyId, decision: &StrategyDecision) {
    let task_id = decision.task.id;
    match decision.action {
        StrategyAction::Cancelled => {
            // Evicted attempts leave every strategy and the queue at once.
            state.release(task_id);
        }
        StrategyAction::Queued => {
            let Some(slot) = state.slots.get_mut(&(strategy_id, task_id)) else {
                return;
            };
            slot.is_filled = true;
            let item = QueueItem {
                tenant_id: slot.tenant_id,
                task: decision.task,
                queue: decision.queue.clone(),
            };
            state.queue_items.insert(task_id, item);
        }
        StrategyAction::DeferToNextStrategy(next) => {
            let Some(slot) = state.slots.get_mut(&(strategy_id, task_id)) else {
                return;
            };
            slot.is_filled = true;
            let tenant_id = slot.tenant_id;
            if state.slots.contains_key(&(next, task_id)) {
                return;
            }
            let Some(task) = state.tasks.get(&task_id) else {
                return;
            };
            let Some(position) = task.concurrency_strategy_ids.iter().position(|id| *id == next)
            else {
                return;
            };
            let key = task
                .concurrency_keys
                .get(position)
                .cloned()
                .unwrap_or_default();
            let remaining = task.concurrency_strategy_ids[position + 1..].to_vec();
            state.insert_slot(
                tenant_id,
                next,
                decision.task,
                key,
                decision.queue.clone(),
                remaining,
            );
        }
    }
}

#[async_trait]
impl ConcurrencyRepository for InMemoryRepository {
    async fn list_active_strategies(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<ConcurrencyStrategy>> {
        let strategies = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .strategies
                .values()
                .filter(|s| s.tenant_id == tenant_id && s.is_active)
                .cloned()
                .collect()
        };
        Ok(strategies)
    }

    async fn run_concurrency_strategy(
        &self,
        tenant_id: TenantId,
        strategy: &ConcurrencyStrategy,
    ) -> Result<RunConcurrencyResult> {
        let _advisory = self.lock_strategy(strategy.id).await?;

        let decisions = {
            let mut state = self.state.write().map_err(poison_err)?;
            let current = state
                .strategies
                .get(&strategy.id)
                .cloned()
                .unwrap_or_else(|| strategy.clone());

            prune_stale_slots(&mut state, current.id);
            let candidates: Vec<SlotCandidate> = state
                .slots
                .values()
                .filter(|slot| slot.strategy_id == current.id && slot.tenant_id == tenant_id)
                .map(|slot| SlotCandidate {
                    task: slot.task,
                    key: slot.key.clone(),
                    sort_id: slot.sort_id,
                    is_filled: slot.is_filled,
                    queue: slot.queue.clone(),
                    next_strategy_ids: slot.next_strategy_ids.clone(),
                })
                .collect();

            let decisions = evaluate(current.kind, current.max_concurrency, &candidates);
            for decision in &decisions {
                apply(&mut state, current.id, decision);
            }
            decisions
        };

        Ok(fold_decisions(&decisions))
    }

    async fn update_concurrency_strategy_is_active(
        &self,
        tenant_id: TenantId,
        strategy: &ConcurrencyStrategy,
    ) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let has_slots = state
            .slots
            .values()
            .any(|slot| slot.strategy_id == strategy.id && slot.tenant_id == tenant_id);
        let is_active = match state.strategies.get_mut(&strategy.id) {
            Some(stored) if stored.tenant_id == tenant_id => {
                stored.is_active = has_slots;
                has_slots
            }
            _ => false,
        };
        drop(state);
        Ok(is_active)
    }
}
