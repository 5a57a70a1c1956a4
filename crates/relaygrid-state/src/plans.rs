//! Plan providers — key-selected strategies deriving limits and expiry.
//!
//! A plan names its provider by key; the table below is the only place a
//! key is resolved. Every provider works on an in-memory period snapshot,
//! so derived values (expiry, remaining bytes) are plain function calls.

use serde::Deserialize;
use tracing::warn;

use crate::types::{Plan, Profile, SubscriptionPeriod};

/// Limits shared by the simple providers.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct SimpleLimits {
    pub total_usage_limit_bytes: u64,
    pub expiry_seconds: u64,
}

pub trait PlanProvider: Send + Sync {
    fn key(&self) -> &'static str;

    /// Limits for this period, or `None` when the arguments are malformed.
    fn limits(&self, plan: &Plan, period: &SubscriptionPeriod) -> Option<SimpleLimits>;

    /// Expiry counts from first use; an unused period expires relative to `now`.
    fn expires_at(&self, plan: &Plan, period: &SubscriptionPeriod, now: u64) -> Option<u64> {
        let limits = self.limits(plan, period)?;
        Some(period.first_usage_at.unwrap_or(now) + limits.expiry_seconds)
    }

    fn total_limit_bytes(&self, plan: &Plan, period: &SubscriptionPeriod) -> Option<u64> {
        self.limits(plan, period).map(|l| l.total_usage_limit_bytes)
    }

    /// Bytes left under the shared cap; negative once the cap is overrun.
    fn dl_bytes_remaining(&self, plan: &Plan, period: &SubscriptionPeriod) -> Option<i64> {
        remaining(self.limits(plan, period)?, period)
    }

    fn up_bytes_remaining(&self, plan: &Plan, period: &SubscriptionPeriod) -> Option<i64> {
        remaining(self.limits(plan, period)?, period)
    }
}

fn remaining(limits: SimpleLimits, period: &SubscriptionPeriod) -> Option<i64> {
    let used = period.counter.current_download_bytes as i128
        + period.counter.current_upload_bytes as i128;
    i64::try_from(limits.total_usage_limit_bytes as i128 - used).ok()
}

fn parse_limits(args: &serde_json::Value, source: &str) -> Option<SimpleLimits> {
    match SimpleLimits::deserialize(args) {
        Ok(limits) => Some(limits),
        Err(e) => {
            warn!(error = %e, source, "malformed plan arguments");
            None
        }
    }
}

/// Limits fixed on the plan (`provider_args`).
pub struct SimpleStrict;

impl PlanProvider for SimpleStrict {
    fn key(&self) -> &'static str {
        "type_simple_strict1"
    }

    fn limits(&self, plan: &Plan, _period: &SubscriptionPeriod) -> Option<SimpleLimits> {
        parse_limits(&plan.provider_args, "plan")
    }
}

/// Limits chosen per period (`plan_args`).
pub struct SimpleDynamic;

impl PlanProvider for SimpleDynamic {
    fn key(&self) -> &'static str {
        "type_simple_dynamic1"
    }

    fn limits(&self, _plan: &Plan, period: &SubscriptionPeriod) -> Option<SimpleLimits> {
        parse_limits(&period.plan_args, "period")
    }
}

static PROVIDERS: [&(dyn PlanProvider); 2] = [&SimpleStrict, &SimpleDynamic];

/// Resolve a provider key.
pub fn provider_for(key: &str) -> Option<&'static dyn PlanProvider> {
    PROVIDERS.iter().copied().find(|p| p.key() == key)
}

/// Whether a period may currently be handed out as a proxy user.
pub fn is_connectable(
    period: &SubscriptionPeriod,
    profile: &Profile,
    plan: &Plan,
    now: u64,
) -> bool {
    if !period.selected_as_current || !profile.is_active {
        return false;
    }
    let Some(provider) = provider_for(&plan.provider_key) else {
        warn!(plan_id = plan.id, key = %plan.provider_key, "unknown plan provider");
        return false;
    };
    let Some(expires_at) = provider.expires_at(plan, period, now) else {
        return false;
    };
    if expires_at <= now {
        return false;
    }
    let dl = provider.dl_bytes_remaining(plan, period).unwrap_or(0);
    let up = provider.up_bytes_remaining(plan, period).unwrap_or(0);
    dl > 0 || up > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UsageCounter;
    use serde_json::json;

    fn plan(key: &str, args: serde_json::Value) -> Plan {
        Plan {
            id: 1,
            connection_rule_id: 1,
            provider_key: key.to_string(),
            provider_args: args,
        }
    }

    fn period(args: serde_json::Value) -> SubscriptionPeriod {
        SubscriptionPeriod {
            id: 1,
            profile_id: 1,
            plan_id: 1,
            plan_args: args,
            selected_as_current: true,
            first_usage_at: None,
            last_usage_at: None,
            counter: UsageCounter::default(),
            claim: None,
        }
    }

    fn profile() -> Profile {
        Profile {
            id: 1,
            is_active: true,
            proxy_uuid: "u".to_string(),
        }
    }

    fn limits(total: u64, expiry: u64) -> serde_json::Value {
        json!({ "total_usage_limit_bytes": total, "expiry_seconds": expiry })
    }

    #[test]
    fn providers_resolve_by_key() {
        assert_eq!(provider_for("type_simple_strict1").unwrap().key(), "type_simple_strict1");
        assert_eq!(provider_for("type_simple_dynamic1").unwrap().key(), "type_simple_dynamic1");
        assert!(provider_for("nope").is_none());
    }

    #[test]
    fn strict_reads_plan_args_dynamic_reads_period_args() {
        let strict = plan("type_simple_strict1", limits(100, 10));
        let dynamic = plan("type_simple_dynamic1", serde_json::Value::Null);
        let p = period(limits(500, 20));

        assert_eq!(SimpleStrict.total_limit_bytes(&strict, &p), Some(100));
        assert_eq!(SimpleDynamic.total_limit_bytes(&dynamic, &p), Some(500));
    }

    #[test]
    fn expiry_counts_from_first_usage() {
        let pl = plan("type_simple_strict1", limits(100, 3600));
        let mut p = period(serde_json::Value::Null);
        assert_eq!(SimpleStrict.expires_at(&pl, &p, 1000), Some(4600));

        p.first_usage_at = Some(200);
        assert_eq!(SimpleStrict.expires_at(&pl, &p, 1000), Some(3800));
    }

    #[test]
    fn remaining_may_go_negative() {
        let pl = plan("type_simple_strict1", limits(100, 3600));
        let mut p = period(serde_json::Value::Null);
        p.counter.current_download_bytes = 80;
        p.counter.current_upload_bytes = 50;
        assert_eq!(SimpleStrict.dl_bytes_remaining(&pl, &p), Some(-30));
    }

    #[test]
    fn connectable_requires_current_active_unexpired_and_quota() {
        let pl = plan("type_simple_strict1", limits(100, 3600));
        let mut p = period(serde_json::Value::Null);
        let mut prof = profile();
        assert!(is_connectable(&p, &prof, &pl, 1000));

        p.first_usage_at = Some(0);
        assert!(!is_connectable(&p, &prof, &pl, 3600), "expired");
        p.first_usage_at = None;

        p.counter.current_download_bytes = 100;
        assert!(!is_connectable(&p, &prof, &pl, 1000), "quota used");
        p.counter.current_download_bytes = 0;

        prof.is_active = false;
        assert!(!is_connectable(&p, &prof, &pl, 1000), "inactive profile");
        prof.is_active = true;

        p.selected_as_current = false;
        assert!(!is_connectable(&p, &prof, &pl, 1000), "not current");
    }

    #[test]
    fn malformed_args_are_not_connectable() {
        let pl = plan("type_simple_strict1", json!({ "total_usage_limit_bytes": "lots" }));
        assert!(!is_connectable(&period(serde_json::Value::Null), &profile(), &pl, 1000));
    }
}
