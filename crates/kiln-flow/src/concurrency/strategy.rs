//! Concurrency admission policies.
//!
//! Each policy looks at the slots of one strategy (filled slots hold
//! capacity, unfilled slots are waiting for admission) and returns explicit
//! decisions. Chaining to a next strategy is a decision variant, not a
//! recursive call; the caller moves deferred attempts into the next
//! strategy's slots.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::repository::{RunConcurrencyResult, TaskWithQueue};
use crate::task::{StrategyId, TaskIdRetryCount};
use crate::workflow::ConcurrencyStrategyKind;

/// A slot considered by a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCandidate {
    /// The attempt occupying the slot.
    pub task: TaskIdRetryCount,
    /// Evaluated concurrency key.
    pub key: String,
    /// Position in the strategy; lower is older.
    pub sort_id: i64,
    /// Whether the slot already holds capacity.
    pub is_filled: bool,
    /// The task's queue.
    pub queue: String,
    /// Strategies the attempt still has to pass after this one.
    pub next_strategy_ids: Vec<StrategyId>,
}

/// What happens to one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyAction {
    /// Admitted into its queue.
    Queued,
    /// Evicted; the task must be cancelled.
    Cancelled,
    /// Admitted here, but still has to pass the given strategy.
    DeferToNextStrategy(StrategyId),
}

/// A decision for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDecision {
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// The task's queue.
    pub queue: String,
    /// The action.
    pub action: StrategyAction,
}

impl StrategyDecision {
    fn admit(slot: &SlotCandidate) -> Self {
        // Only the first downstream strategy is consulted.
        let action = slot
            .next_strategy_ids
            .first()
            .map_or(StrategyAction::Queued, |next| {
                StrategyAction::DeferToNextStrategy(*next)
            });
        Self {
            task: slot.task,
            queue: slot.queue.clone(),
            action,
        }
    }

    fn cancel(slot: &SlotCandidate) -> Self {
        Self {
            task: slot.task,
            queue: slot.queue.clone(),
            action: StrategyAction::Cancelled,
        }
    }
}

/// Evaluates a policy over the slots of one strategy.
///
/// Returns decisions only for slots whose state changes; filled slots that
/// keep their capacity are not reported.
#[must_use]
pub fn evaluate(
    kind: ConcurrencyStrategyKind,
    max_concurrency: i32,
    slots: &[SlotCandidate],
) -> Vec<StrategyDecision> {
    let max = usize::try_from(max_concurrency).unwrap_or(0);
    match kind {
        ConcurrencyStrategyKind::GroupRoundRobin => group_round_robin(max, slots),
        ConcurrencyStrategyKind::CancelInProgress => cancel_in_progress(max, slots),
        ConcurrencyStrategyKind::CancelNewest => cancel_newest(max, slots),
    }
}

/// Admits up to `max` slots overall, always from the group that currently
/// holds the least capacity, oldest head first on ties.
fn group_round_robin(max: usize, slots: &[SlotCandidate]) -> Vec<StrategyDecision> {
    let filled = slots.iter().filter(|s| s.is_filled).count();
    let mut capacity = max.saturating_sub(filled);

    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut waiting: BTreeMap<&str, Vec<&SlotCandidate>> = BTreeMap::new();
    for slot in slots {
        if slot.is_filled {
            *levels.entry(slot.key.as_str()).or_default() += 1;
        } else {
            waiting.entry(slot.key.as_str()).or_default().push(slot);
        }
    }
    let mut groups: BTreeMap<&str, VecDeque<&SlotCandidate>> = waiting
        .into_iter()
        .map(|(key, mut group)| {
            group.sort_by_key(|s| s.sort_id);
            (key, VecDeque::from(group))
        })
        .collect();

    let mut decisions = Vec::new();
    while capacity > 0 {
        let next = groups
            .iter()
            .filter_map(|(key, group)| group.front().map(|head| (*key, head.sort_id)))
            .min_by_key(|(key, sort_id)| (levels.get(key).copied().unwrap_or(0), *sort_id));
        let Some((key, _)) = next else {
            break;
        };
        if let Some(slot) = groups.get_mut(key).and_then(VecDeque::pop_front) {
            decisions.push(StrategyDecision::admit(slot));
            *levels.entry(key).or_default() += 1;
            capacity -= 1;
        }
    }
    decisions
}

fn by_key(slots: &[SlotCandidate]) -> BTreeMap<&str, Vec<&SlotCandidate>> {
    let mut groups: BTreeMap<&str, Vec<&SlotCandidate>> = BTreeMap::new();
    for slot in slots {
        groups.entry(slot.key.as_str()).or_default().push(slot);
    }
    groups
}

/// Per key, keeps the `max` newest slots and evicts everything older,
/// including attempts already in progress.
fn cancel_in_progress(max: usize, slots: &[SlotCandidate]) -> Vec<StrategyDecision> {
    let mut decisions = Vec::new();
    for (_, mut group) in by_key(slots) {
        group.sort_by_key(|s| std::cmp::Reverse(s.sort_id));
        for (rank, slot) in group.into_iter().enumerate() {
            if rank >= max {
                decisions.push(StrategyDecision::cancel(slot));
            } else if !slot.is_filled {
                decisions.push(StrategyDecision::admit(slot));
            }
        }
    }
    decisions
}

/// Per key, keeps in-progress slots first and then the oldest waiting
/// slots up to `max`; newer waiting slots are evicted.
fn cancel_newest(max: usize, slots: &[SlotCandidate]) -> Vec<StrategyDecision> {
    let mut decisions = Vec::new();
    for (_, mut group) in by_key(slots) {
        group.sort_by_key(|s| (!s.is_filled, s.sort_id));
        for (rank, slot) in group.into_iter().enumerate() {
            if slot.is_filled {
                continue;
            }
            if rank >= max {
                decisions.push(StrategyDecision::cancel(slot));
            } else {
                decisions.push(StrategyDecision::admit(slot));
            }
        }
    }
    decisions
}

/// Folds decisions into the result reported by a strategy run.
#[must_use]
pub fn fold_decisions(decisions: &[StrategyDecision]) -> RunConcurrencyResult {
    let mut result = RunConcurrencyResult::default();
    for decision in decisions {
        let entry = TaskWithQueue {
            task: decision.task,
            queue: decision.queue.clone(),
        };
        match decision.action {
            StrategyAction::Queued => result.queued.push(entry),
            StrategyAction::Cancelled => result.cancelled.push(entry),
            StrategyAction::DeferToNextStrategy(next) => {
                if !result.next_strategy_ids.contains(&next) {
                    result.next_strategy_ids.push(next);
                }
            }
        }
    }
    result
}
