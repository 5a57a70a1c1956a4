//! The period store seam used by the accountant and the traffic ingestor.

use relay_core::{NodeId, PeriodId, RuleId};
use relaygrid_state::{Claim, ClaimOp, StateResult, StateStore, SubscriptionPeriod, UsageCounter};

/// Filter deciding whether a period is due for an operation.
pub type DueFn<'a> = &'a (dyn Fn(&SubscriptionPeriod) -> bool + Sync);

/// Sort key for claims; `None` sorts first.
pub type OrderFn<'a> = &'a (dyn Fn(&SubscriptionPeriod) -> Option<u64> + Sync);

/// Claimable storage of subscription periods and their usage counters.
pub trait PeriodStore: Send + Sync {
    /// Atomically claim up to `limit` due periods for `op`.
    fn claim(
        &self,
        op: ClaimOp,
        now: u64,
        lease_secs: u64,
        limit: usize,
        due: DueFn<'_>,
        order: OrderFn<'_>,
    ) -> StateResult<Vec<SubscriptionPeriod>>;

    /// Write the counter and release `claim`. `false` if the period no longer
    /// holds that exact claim.
    fn commit(&self, period_id: PeriodId, claim: Claim, counter: &UsageCounter) -> StateResult<bool>;

    /// Release `claim` without touching the counter.
    fn release(&self, period_id: PeriodId, claim: Claim) -> StateResult<bool>;

    /// Widen a period's usage window to include `at`.
    fn touch_period(&self, period_id: PeriodId, at: u64) -> StateResult<bool>;

    /// Widen an internal user's usage window to include `at`.
    fn touch_internal_user(&self, rule_id: RuleId, node_id: NodeId, at: u64) -> StateResult<bool>;
}

impl PeriodStore for StateStore {
    fn claim(
        &self,
        op: ClaimOp,
        now: u64,
        lease_secs: u64,
        limit: usize,
        due: DueFn<'_>,
        order: OrderFn<'_>,
    ) -> StateResult<Vec<SubscriptionPeriod>> {
        self.claim_periods(op, now, lease_secs, limit, due, order)
    }

    fn commit(&self, period_id: PeriodId, claim: Claim, counter: &UsageCounter) -> StateResult<bool> {
        self.commit_counter(period_id, claim, counter)
    }

    fn release(&self, period_id: PeriodId, claim: Claim) -> StateResult<bool> {
        self.release_claim(period_id, claim)
    }

    fn touch_period(&self, period_id: PeriodId, at: u64) -> StateResult<bool> {
        self.touch_period_usage(period_id, at)
    }

    fn touch_internal_user(&self, rule_id: RuleId, node_id: NodeId, at: u64) -> StateResult<bool> {
        self.touch_internal_user_usage(rule_id, node_id, at)
    }
}
