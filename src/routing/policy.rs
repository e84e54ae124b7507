//! Strategy ordering policies.
//!
//! Pure functions over registry snapshots: each policy turns the eligible
//! set into an ordered list of strategy names for one request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::{LoadBalanceAlgorithm, RoutingPolicy};
use crate::routing::registry::StrategySnapshot;

/// Floor for the latency term so near-zero averages do not dominate.
const RESPONSE_TIME_EPSILON: f64 = 0.05;

/// Adaptive ranking score: success rate dominates, latency second,
/// configured priority as a light tie-break.
pub fn adaptive_score(snapshot: &StrategySnapshot) -> f64 {
    let avg_secs = snapshot
        .avg_response_time
        .max(Duration::from_secs_f64(RESPONSE_TIME_EPSILON))
        .as_secs_f64();
    0.6 * snapshot.success_rate + 0.3 * (1.0 / avg_secs) + 0.1 * (snapshot.priority as f64 / 10.0)
}

/// Order eligible snapshots under the configured policy.
///
/// `rr_cursor` is the shared rotating index for round-robin;
/// `failover_threshold` is the success-rate floor a strategy must clear to
/// be considered healthy by the failover policy.
pub fn compute_order(
    policy: RoutingPolicy,
    algorithm: LoadBalanceAlgorithm,
    mut snapshots: Vec<StrategySnapshot>,
    rr_cursor: &AtomicUsize,
    failover_threshold: f64,
) -> Vec<String> {
    match policy {
        RoutingPolicy::Priority => {
            snapshots.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        RoutingPolicy::Adaptive => {
            snapshots.sort_by(|a, b| {
                adaptive_score(b)
                    .partial_cmp(&adaptive_score(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        RoutingPolicy::LoadBalance => match algorithm {
            LoadBalanceAlgorithm::RoundRobin => {
                if !snapshots.is_empty() {
                    let offset = rr_cursor.fetch_add(1, Ordering::Relaxed) % snapshots.len();
                    snapshots.rotate_left(offset);
                }
            }
            LoadBalanceAlgorithm::Weighted => {
                snapshots.sort_by(|a, b| {
                    b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name))
                });
            }
            LoadBalanceAlgorithm::LeastConnections => {
                snapshots.sort_by(|a, b| {
                    a.concurrent_requests
                        .cmp(&b.concurrent_requests)
                        .then_with(|| a.name.cmp(&b.name))
                });
            }
            LoadBalanceAlgorithm::ResponseTime => {
                snapshots.sort_by(|a, b| {
                    a.avg_response_time
                        .cmp(&b.avg_response_time)
                        .then_with(|| a.name.cmp(&b.name))
                });
            }
        },
        RoutingPolicy::Failover => {
            // Healthiest strategy leads; everyone else keeps their relative
            // order behind it as backup.
            let healthiest = snapshots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.success_rate >= failover_threshold)
                .max_by(|(_, a), (_, b)| {
                    a.success_rate
                        .partial_cmp(&b.success_rate)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(index, _)| index);
            if let Some(index) = healthiest {
                let lead = snapshots.remove(index);
                snapshots.insert(0, lead);
            }
        }
    }

    snapshots.into_iter().map(|s| s.name).collect()
}
