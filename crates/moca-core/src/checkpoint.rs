//! # Checkpoints and Rollforward
//!
//! Aggregates (global, per account, per delegate) are stored as a
//! [`VeBalance`] plus the week they were last brought up to date. Locks
//! that expire in the future are recorded in a slope-change schedule keyed
//! by expiry week. Advancing an aggregate to the current week walks the
//! weeks it missed and removes each week's expiring cohort:
//!
//! ```text
//!   last_updated_at            now
//!        │  w+1    w+2    w+3   │
//!        ├──────┬──────┬──────┤
//!        │  -Δ1 │  -Δ2 │  -Δ3 │    Δi = schedule[w+i]
//! ```
//!
//! The walk costs O(weeks since last touch), independent of lock count.
//! [`roll_forward`] is a pure function so it can be tested without storage.

use crate::clock::week_start;
use crate::constants::WEEK;
use crate::error::{ProtocolError, Result};
use crate::ve_balance::VeBalance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scheduled slope decreases, keyed by week-aligned expiry
pub trait SlopeSchedule {
    fn slope_change_at(&self, week: u64) -> u128;
}

impl SlopeSchedule for BTreeMap<u64, u128> {
    fn slope_change_at(&self, week: u64) -> u128 {
        self.get(&week).copied().unwrap_or(0)
    }
}

/// Snapshot of an aggregate at the start of a week
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ve: VeBalance,
    pub week: u64,
}

/// Aggregate balance with its freshness marker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub balance: VeBalance,
    /// Week start the balance is valid for; zero means never touched
    pub last_updated_at: u64,
}

/// Result of advancing an aggregate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollForward {
    pub aggregate: Aggregate,
    /// One checkpoint per week boundary crossed, oldest first
    pub crossed: Vec<Checkpoint>,
}

/// Walk `balance` from `from_week` (exclusive) to `to_week` (inclusive)
fn advance<S, F>(
    mut balance: VeBalance,
    from_week: u64,
    to_week: u64,
    schedule: &S,
    mut on_week: F,
) -> Result<VeBalance>
where
    S: SlopeSchedule + ?Sized,
    F: FnMut(u64, &VeBalance),
{
    let mut week = from_week + WEEK;
    while week <= to_week {
        balance = balance.subtract_expired(schedule.slope_change_at(week), week)?;
        on_week(week, &balance);
        week += WEEK;
    }
    Ok(balance)
}

/// Advance a stored aggregate to `current_week`
///
/// Idempotent: a second call for the same week returns the state unchanged
/// with no crossed weeks.
pub fn roll_forward<S>(state: &Aggregate, schedule: &S, current_week: u64) -> Result<RollForward>
where
    S: SlopeSchedule + ?Sized,
{
    if state.last_updated_at >= current_week {
        return Ok(RollForward { aggregate: *state, crossed: Vec::new() });
    }

    if state.last_updated_at == 0 {
        return Ok(RollForward {
            aggregate: Aggregate { balance: VeBalance::ZERO, last_updated_at: current_week },
            crossed: Vec::new(),
        });
    }

    let mut crossed = Vec::new();
    let balance = advance(
        state.balance,
        state.last_updated_at,
        current_week,
        schedule,
        |week, ve| crossed.push(Checkpoint { ve: *ve, week }),
    )?;

    Ok(RollForward {
        aggregate: Aggregate { balance, last_updated_at: current_week },
        crossed,
    })
}

/// Evaluate a checkpoint forward to an exact timestamp
///
/// Applies every scheduled expiry between the checkpoint week and the
/// week containing `timestamp`, then evaluates the line at `timestamp`.
pub fn project<S>(checkpoint: &Checkpoint, schedule: &S, timestamp: u64) -> Result<u128>
where
    S: SlopeSchedule + ?Sized,
{
    if timestamp < checkpoint.week {
        return Err(ProtocolError::Internal(format!(
            "projection to {} precedes checkpoint week {}",
            timestamp, checkpoint.week
        )));
    }
    let balance = advance(checkpoint.ve, checkpoint.week, week_start(timestamp), schedule, |_, _| {})?;
    Ok(balance.value_at(timestamp))
}

/// Append-only checkpoint history, at most one entry per week
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHistory {
    entries: Vec<Checkpoint>,
}

impl CheckpointHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a checkpoint, overwriting one already stored for the same week
    pub fn record(&mut self, checkpoint: Checkpoint) -> Result<()> {
        match self.entries.last_mut() {
            Some(last) if last.week == checkpoint.week => {
                *last = checkpoint;
                Ok(())
            }
            Some(last) if last.week > checkpoint.week => Err(ProtocolError::Internal(format!(
                "checkpoint for week {} after week {}",
                checkpoint.week, last.week
            ))),
            _ => {
                self.entries.push(checkpoint);
                Ok(())
            }
        }
    }

    /// Latest checkpoint whose week is at or before `week` (binary search)
    pub fn latest_at_or_before(&self, week: u64) -> Option<&Checkpoint> {
        let idx = self.entries.partition_point(|c| c.week <= week);
        idx.checked_sub(1).map(|i| &self.entries[i])
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ONE: u128 = 1_000_000_000_000_000_000;
    const START: u64 = 2_800 * WEEK;

    fn schedule_of(entries: &[(u64, u128)]) -> BTreeMap<u64, u128> {
        let mut schedule = BTreeMap::new();
        for (week, slope) in entries {
            *schedule.entry(*week).or_insert(0) += slope;
        }
        schedule
    }

    #[test]
    fn test_first_touch_initializes_at_now() {
        let rolled = roll_forward(&Aggregate::default(), &BTreeMap::new(), START).unwrap();
        assert_eq!(rolled.aggregate.last_updated_at, START);
        assert!(rolled.aggregate.balance.is_zero());
        assert!(rolled.crossed.is_empty());
    }

    #[test]
    fn test_rollforward_removes_expired_cohort() {
        let a = VeBalance::from_lock(1_000 * ONE, START + 2 * WEEK).unwrap();
        let b = VeBalance::from_lock(2_000 * ONE, START + 5 * WEEK).unwrap();
        let schedule = schedule_of(&[(START + 2 * WEEK, a.slope), (START + 5 * WEEK, b.slope)]);
        let state = Aggregate { balance: a.add(&b).unwrap(), last_updated_at: START };

        let rolled = roll_forward(&state, &schedule, START + 3 * WEEK).unwrap();
        assert_eq!(rolled.aggregate.balance, b);
        assert_eq!(rolled.crossed.len(), 3);
        assert_eq!(rolled.crossed[1].week, START + 2 * WEEK);
        assert_eq!(rolled.crossed[1].ve, b);
    }

    #[test]
    fn test_rollforward_is_idempotent() {
        let a = VeBalance::from_lock(1_000 * ONE, START + 4 * WEEK).unwrap();
        let schedule = schedule_of(&[(START + 4 * WEEK, a.slope)]);
        let state = Aggregate { balance: a, last_updated_at: START };

        let once = roll_forward(&state, &schedule, START + 2 * WEEK).unwrap();
        let twice = roll_forward(&once.aggregate, &schedule, START + 2 * WEEK).unwrap();
        assert_eq!(once.aggregate, twice.aggregate);
        assert!(twice.crossed.is_empty());
    }

    #[test]
    fn test_project_sub_week_precision() {
        let a = VeBalance::from_lock(1_000 * ONE, START + 10 * WEEK).unwrap();
        let b = VeBalance::from_lock(1_000 * ONE, START + 2 * WEEK).unwrap();
        let schedule = schedule_of(&[(START + 10 * WEEK, a.slope), (START + 2 * WEEK, b.slope)]);
        let cp = Checkpoint { ve: a.add(&b).unwrap(), week: START };

        let t = START + 3 * WEEK + 12_345;
        assert_eq!(project(&cp, &schedule, t).unwrap(), a.value_at(t));

        let t_early = START + 1_000;
        assert_eq!(
            project(&cp, &schedule, t_early).unwrap(),
            a.value_at(t_early) + b.value_at(t_early)
        );
    }

    #[test]
    fn test_project_before_checkpoint_is_error() {
        let cp = Checkpoint { ve: VeBalance::ZERO, week: START };
        assert!(project(&cp, &BTreeMap::new(), START - 1).is_err());
    }

    #[test]
    fn test_history_overwrites_same_week() {
        let mut history = CheckpointHistory::new();
        history.record(Checkpoint { ve: VeBalance::new(1, 0), week: START }).unwrap();
        history.record(Checkpoint { ve: VeBalance::new(2, 0), week: START }).unwrap();
        history.record(Checkpoint { ve: VeBalance::new(3, 0), week: START + WEEK }).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest_at_or_before(START).unwrap().ve.bias, 2);
        assert!(history.latest_at_or_before(START - WEEK).is_none());
        assert_eq!(history.latest_at_or_before(START + 9 * WEEK).unwrap().ve.bias, 3);
        assert!(history.record(Checkpoint { ve: VeBalance::ZERO, week: START }).is_err());
    }

    proptest! {
        #[test]
        fn prop_stepwise_equals_single_jump(
            locks in proptest::collection::vec((1u128..1_000_000 * ONE, 1u64..30), 1..12),
            stop in 1u64..35,
        ) {
            let mut balance = VeBalance::ZERO;
            let mut schedule = BTreeMap::new();
            for (amount, weeks) in &locks {
                let expiry = START + weeks * WEEK;
                let ve = VeBalance::from_lock(*amount, expiry).unwrap();
                balance = balance.add(&ve).unwrap();
                *schedule.entry(expiry).or_insert(0u128) += ve.slope;
            }
            let state = Aggregate { balance, last_updated_at: START };
            let target = START + stop * WEEK;

            let jump = roll_forward(&state, &schedule, target).unwrap();
            let mut stepped = state;
            for w in 1..=stop {
                stepped = roll_forward(&stepped, &schedule, START + w * WEEK).unwrap().aggregate;
            }
            prop_assert_eq!(jump.aggregate, stepped);

            let expected: u128 = locks
                .iter()
                .map(|(amount, weeks)| {
                    VeBalance::from_lock(*amount, START + weeks * WEEK).unwrap().value_at(target)
                })
                .sum();
            prop_assert_eq!(jump.aggregate.balance.value_at(target), expected);
        }
    }
}
