//! Balancer strategy compilation.
//!
//! Turns weighted members into per-member costs for the runtime's
//! least-load balancer. A member's cost is the total weight divided by its
//! own weight, so heavier members look cheaper. Costs are computed in
//! decimal arithmetic and rounded half-down to two places.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use relay_core::NodeId;

/// One balancer member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub tag: String,
    pub weight: u32,
}

impl Candidate {
    pub fn new(tag: impl Into<String>, weight: u32) -> Self {
        Self {
            tag: tag.into(),
            weight,
        }
    }
}

/// Compiled balancer membership.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPlan {
    /// Member costs in selector order.
    pub costs: Vec<(String, Decimal)>,
    /// Member tags ordered by the sha256 of the tag.
    pub selector: Vec<String>,
    pub fallback: Option<String>,
}

impl StrategyPlan {
    pub fn cost_of(&self, tag: &str) -> Option<Decimal> {
        self.costs.iter().find(|(t, _)| t == tag).map(|(_, c)| *c)
    }

    /// Cost entries as the runtime expects them.
    pub fn cost_entries(&self) -> Vec<Value> {
        self.costs
            .iter()
            .map(|(tag, cost)| {
                json!({
                    "regexp": false,
                    "match": tag,
                    "value": decimal_to_json(*cost),
                })
            })
            .collect()
    }
}

const MIN_COST: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// `max(0.01, round_half_down(total / weight, 2))`.
pub fn cost(total: u64, weight: u32) -> Decimal {
    if weight == 0 {
        return MIN_COST;
    }
    let ratio = Decimal::from(total) / Decimal::from(weight);
    ratio
        .round_dp_with_strategy(2, RoundingStrategy::MidpointTowardZero)
        .max(MIN_COST)
}

fn order_key(tag: &str) -> String {
    hex::encode(Sha256::digest(tag.as_bytes()))
}

/// Compile the membership of one balancer.
///
/// Zero-weight members are dropped, duplicate tags are merged. Returns
/// `None` when nothing is left. The fallback is drawn uniformly from the
/// members sharing the maximum weight.
pub fn compile<R: Rng + ?Sized>(candidates: &[Candidate], rng: &mut R) -> Option<StrategyPlan> {
    let mut merged: Vec<Candidate> = Vec::new();
    for c in candidates.iter().filter(|c| c.weight > 0) {
        match merged.iter_mut().find(|m| m.tag == c.tag) {
            Some(m) => m.weight = m.weight.saturating_add(c.weight),
            None => merged.push(c.clone()),
        }
    }
    if merged.is_empty() {
        return None;
    }

    merged.sort_by_cached_key(|c| (order_key(&c.tag), c.tag.clone()));
    let total: u64 = merged.iter().map(|c| u64::from(c.weight)).sum();
    let max_weight = merged.iter().map(|c| c.weight).max().unwrap_or(0);

    let heaviest: Vec<&Candidate> = merged.iter().filter(|c| c.weight == max_weight).collect();
    let fallback = heaviest.choose(rng).map(|c| c.tag.clone());

    Some(StrategyPlan {
        costs: merged
            .iter()
            .map(|c| (c.tag.clone(), cost(total, c.weight)))
            .collect(),
        selector: merged.iter().map(|c| c.tag.clone()).collect(),
        fallback,
    })
}

/// RNG for one balancer on one node.
///
/// Recompiling the same node picks the same fallback; different nodes
/// spread their picks across the tied members.
pub fn seeded_rng(node_id: NodeId, balancer_tag: &str) -> StdRng {
    let digest = Sha256::digest(format!("{node_id}/{balancer_tag}").as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    StdRng::from_seed(seed)
}

/// Least-load strategy block used when a balancer has no template.
pub fn default_strategy(plan: &StrategyPlan, baselines_ms: &[u64], max_rtt_ms: Option<u64>) -> Value {
    let mut settings = serde_json::Map::new();
    settings.insert("costs".to_string(), Value::Array(plan.cost_entries()));
    if !baselines_ms.is_empty() {
        let baselines: Vec<Value> = baselines_ms
            .iter()
            .map(|ms| Value::String(format!("{ms}ms")))
            .collect();
        settings.insert("baselines".to_string(), Value::Array(baselines));
    }
    if let Some(ms) = max_rtt_ms {
        settings.insert("maxRTT".to_string(), Value::String(format!("{ms}ms")));
    }
    json!({
        "type": "leastLoad",
        "settings": settings,
    })
}

fn decimal_to_json(d: Decimal) -> Value {
    serde_json::from_str(&d.to_string()).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(num: i64, scale: u32) -> Decimal {
        Decimal::new(num, scale)
    }

    fn abc() -> Vec<Candidate> {
        vec![
            Candidate::new("A", 2),
            Candidate::new("B", 2),
            Candidate::new("C", 4),
        ]
    }

    // ── Costs ──────────────────────────────────────────────────────

    #[test]
    fn costs_from_weights() {
        let plan = compile(&abc(), &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(plan.cost_of("A"), Some(dec(400, 2)));
        assert_eq!(plan.cost_of("B"), Some(dec(400, 2)));
        assert_eq!(plan.cost_of("C"), Some(dec(200, 2)));
    }

    #[test]
    fn cost_rounds_half_down() {
        // 9 / 8 = 1.125 exactly.
        assert_eq!(cost(9, 8), dec(112, 2));
        // 8 / 3 = 2.666…
        assert_eq!(cost(8, 3), dec(267, 2));
        assert_eq!(cost(8, 5), dec(160, 2));
    }

    #[test]
    fn cost_has_floor() {
        assert_eq!(cost(0, 5), dec(1, 2));
        assert_eq!(cost(1, 1000), dec(1, 2));
    }

    // ── Membership ─────────────────────────────────────────────────

    #[test]
    fn zero_weights_contribute_nothing() {
        let all_zero = vec![Candidate::new("A", 0), Candidate::new("B", 0)];
        assert!(compile(&all_zero, &mut StdRng::seed_from_u64(1)).is_none());

        let mixed = vec![Candidate::new("A", 0), Candidate::new("B", 3)];
        let plan = compile(&mixed, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(plan.selector, vec!["B"]);
        assert_eq!(plan.cost_of("B"), Some(dec(100, 2)));
    }

    #[test]
    fn selector_ordered_by_tag_digest() {
        let plan = compile(&abc(), &mut StdRng::seed_from_u64(1)).unwrap();
        let mut expected = vec!["A", "B", "C"];
        expected.sort_by_key(|t| order_key(t));
        assert_eq!(plan.selector, expected);

        // Input order does not matter.
        let mut reversed = abc();
        reversed.reverse();
        let again = compile(&reversed, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(again.selector, plan.selector);
        assert_eq!(again.costs, plan.costs);
    }

    #[test]
    fn duplicate_tags_merge() {
        let plan = compile(
            &[Candidate::new("A", 1), Candidate::new("A", 2), Candidate::new("B", 3)],
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
        assert_eq!(plan.selector.len(), 2);
        assert_eq!(plan.cost_of("A"), Some(dec(200, 2)));
    }

    // ── Fallback ───────────────────────────────────────────────────

    #[test]
    fn fallback_is_strict_heaviest() {
        for seed in 0..50 {
            let plan = compile(&abc(), &mut StdRng::seed_from_u64(seed)).unwrap();
            assert_eq!(plan.fallback.as_deref(), Some("C"));
        }
    }

    #[test]
    fn fallback_tie_is_roughly_even() {
        let tied = vec![
            Candidate::new("A", 2),
            Candidate::new("B", 2),
            Candidate::new("C", 1),
        ];
        let mut a = 0;
        let runs = 2000;
        for seed in 0..runs {
            let plan = compile(&tied, &mut StdRng::seed_from_u64(seed)).unwrap();
            match plan.fallback.as_deref() {
                Some("A") => a += 1,
                Some("B") => {}
                other => panic!("unexpected fallback {other:?}"),
            }
        }
        assert!((800..=1200).contains(&a), "A picked {a} of {runs}");
    }

    #[test]
    fn seeded_rng_is_stable_per_node_and_balancer() {
        let tied = vec![Candidate::new("A", 1), Candidate::new("B", 1)];
        let first = compile(&tied, &mut seeded_rng(1, "lb_1_main")).unwrap();
        let second = compile(&tied, &mut seeded_rng(1, "lb_1_main")).unwrap();
        assert_eq!(first.fallback, second.fallback);
    }

    // ── Strategy block ─────────────────────────────────────────────

    #[test]
    fn default_strategy_shape() {
        let plan = compile(&[Candidate::new("ro_1_1", 5), Candidate::new("rp_1_2_3_main", 3)], &mut StdRng::seed_from_u64(1))
            .unwrap();
        let strategy = default_strategy(&plan, &[1000, 2000], Some(3000));
        assert_eq!(strategy["type"], "leastLoad");
        assert_eq!(strategy["settings"]["baselines"], json!(["1000ms", "2000ms"]));
        assert_eq!(strategy["settings"]["maxRTT"], "3000ms");
        let costs = strategy["settings"]["costs"].as_array().unwrap();
        assert_eq!(costs.len(), 2);
        let direct = costs.iter().find(|c| c["match"] == "ro_1_1").unwrap();
        assert_eq!(direct["value"], json!(1.6));
    }
}
