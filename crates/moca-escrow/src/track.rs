//! Aggregate tracks
//!
//! One [`AggregateTrack`] holds everything needed to answer "how much
//! voting power did X have at time t" for one entity: the live aggregate,
//! its slope-change schedule and its weekly checkpoint history. The same
//! type backs the global supply, personal accounts, delegates and
//! delegator/delegate pairs.

use moca_core::checkpoint::{self, Aggregate, Checkpoint, CheckpointHistory};
use moca_core::clock::{epoch_end, week_start};
use moca_core::constants::WEEK;
use moca_core::{ProtocolError, Result, VeBalance};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTrack {
    aggregate: Aggregate,
    slope_changes: BTreeMap<u64, u128>,
    history: CheckpointHistory,
}

impl AggregateTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> VeBalance {
        self.aggregate.balance
    }

    pub fn last_updated_at(&self) -> u64 {
        self.aggregate.last_updated_at
    }

    pub fn slope_change_at(&self, week: u64) -> u128 {
        self.slope_changes.get(&week).copied().unwrap_or(0)
    }

    pub fn history(&self) -> &CheckpointHistory {
        &self.history
    }

    /// Bring the aggregate up to `week`, persisting one checkpoint per week crossed
    pub fn roll_forward(&mut self, week: u64) -> Result<Vec<Checkpoint>> {
        let rolled = checkpoint::roll_forward(&self.aggregate, &self.slope_changes, week)?;
        for cp in &rolled.crossed {
            self.history.record(*cp)?;
        }
        if !rolled.crossed.is_empty() {
            debug!(
                from = self.aggregate.last_updated_at,
                to = week,
                weeks = rolled.crossed.len(),
                "rolled aggregate forward"
            );
        }
        self.aggregate = rolled.aggregate;
        Ok(rolled.crossed)
    }

    /// Add a contribution expiring at `expiry`
    pub fn add(&mut self, ve: &VeBalance, expiry: u64) -> Result<()> {
        self.aggregate.balance = self.aggregate.balance.add(ve)?;
        if ve.slope > 0 {
            let entry = self.slope_changes.entry(expiry).or_insert(0);
            *entry = entry.checked_add(ve.slope).ok_or(ProtocolError::ArithmeticOverflow)?;
        }
        self.checkpoint()
    }

    /// Remove part of a contribution expiring at `expiry`
    pub fn sub(&mut self, ve: &VeBalance, expiry: u64) -> Result<()> {
        self.aggregate.balance = self.aggregate.balance.sub(ve)?;
        self.unschedule(ve.slope, expiry)?;
        self.checkpoint()
    }

    /// Move a contribution of `slope` from `old_expiry` to `new_expiry`
    ///
    /// The extra bias is `slope * (new_expiry - old_expiry)`.
    pub fn extend(&mut self, added_bias: u128, slope: u128, old_expiry: u64, new_expiry: u64) -> Result<()> {
        let delta = VeBalance::new(added_bias, 0);
        self.aggregate.balance = self.aggregate.balance.add(&delta)?;
        if slope > 0 {
            self.unschedule(slope, old_expiry)?;
            let entry = self.slope_changes.entry(new_expiry).or_insert(0);
            *entry = entry.checked_add(slope).ok_or(ProtocolError::ArithmeticOverflow)?;
        }
        self.checkpoint()
    }

    fn unschedule(&mut self, slope: u128, expiry: u64) -> Result<()> {
        if slope == 0 {
            return Ok(());
        }
        let current = self.slope_change_at(expiry);
        let remaining = current
            .checked_sub(slope)
            .ok_or(ProtocolError::ArithmeticUnderflow("slope schedule"))?;
        if remaining == 0 {
            self.slope_changes.remove(&expiry);
        } else {
            self.slope_changes.insert(expiry, remaining);
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.history.record(Checkpoint {
            ve: self.aggregate.balance,
            week: self.aggregate.last_updated_at,
        })
    }

    /// Value at an exact timestamp
    pub fn value_at(&self, timestamp: u64) -> Result<u128> {
        match self.history.latest_at_or_before(week_start(timestamp)) {
            Some(cp) => checkpoint::project(cp, &self.slope_changes, timestamp),
            None => Ok(0),
        }
    }

    /// Value at the end of `epoch`, ignoring changes made after the epoch closed
    pub fn value_at_epoch_end(&self, epoch: u64) -> Result<u128> {
        let end = epoch_end(epoch);
        match self.history.latest_at_or_before(end - WEEK) {
            Some(cp) => checkpoint::project(cp, &self.slope_changes, end),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moca_core::clock::epoch_start;
    use moca_core::{EPOCH_DURATION, ONE_MOCA};

    const EPOCH: u64 = 1_400;

    #[test]
    fn test_add_schedules_and_checkpoints() {
        let start = epoch_start(EPOCH);
        let mut track = AggregateTrack::new();
        track.roll_forward(start).unwrap();

        let ve = VeBalance::from_lock(1_000 * ONE_MOCA, start + 10 * WEEK).unwrap();
        track.add(&ve, start + 10 * WEEK).unwrap();

        assert_eq!(track.balance(), ve);
        assert_eq!(track.slope_change_at(start + 10 * WEEK), ve.slope);
        assert_eq!(track.history().len(), 1);
        assert_eq!(track.value_at(start + WEEK).unwrap(), ve.value_at(start + WEEK));
    }

    #[test]
    fn test_epoch_end_ignores_next_epoch_changes() {
        let start = epoch_start(EPOCH);
        let mut track = AggregateTrack::new();
        track.roll_forward(start).unwrap();
        let first = VeBalance::from_lock(1_000 * ONE_MOCA, start + 20 * WEEK).unwrap();
        track.add(&first, start + 20 * WEEK).unwrap();

        let next_epoch = start + EPOCH_DURATION;
        track.roll_forward(next_epoch).unwrap();
        let second = VeBalance::from_lock(5_000 * ONE_MOCA, start + 30 * WEEK).unwrap();
        track.add(&second, start + 30 * WEEK).unwrap();

        assert_eq!(track.value_at_epoch_end(EPOCH).unwrap(), first.value_at(next_epoch));
        assert_eq!(
            track.value_at_epoch_end(EPOCH + 1).unwrap(),
            first.value_at(next_epoch + EPOCH_DURATION) + second.value_at(next_epoch + EPOCH_DURATION)
        );
    }

    #[test]
    fn test_extend_moves_schedule() {
        let start = epoch_start(EPOCH);
        let mut track = AggregateTrack::new();
        track.roll_forward(start).unwrap();
        let old = VeBalance::from_lock(1_000 * ONE_MOCA, start + 10 * WEEK).unwrap();
        track.add(&old, start + 10 * WEEK).unwrap();

        let new = VeBalance::from_lock(1_000 * ONE_MOCA, start + 14 * WEEK).unwrap();
        track
            .extend(new.bias - old.bias, old.slope, start + 10 * WEEK, start + 14 * WEEK)
            .unwrap();

        assert_eq!(track.balance(), new);
        assert_eq!(track.slope_change_at(start + 10 * WEEK), 0);
        assert_eq!(track.slope_change_at(start + 14 * WEEK), new.slope);
    }

    #[test]
    fn test_sub_more_than_scheduled_fails() {
        let start = epoch_start(EPOCH);
        let mut track = AggregateTrack::new();
        track.roll_forward(start).unwrap();
        let ve = VeBalance::from_lock(1_000 * ONE_MOCA, start + 10 * WEEK).unwrap();
        track.add(&ve, start + 10 * WEEK).unwrap();

        let too_much = VeBalance::new(ve.bias, ve.slope + 1);
        assert!(track.sub(&too_much, start + 10 * WEEK).is_err());
    }
}
