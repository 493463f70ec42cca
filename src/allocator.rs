//! Pure agent-to-pod allocation. No I/O: this module only ever sees a
//! `Vec<Service>` and returns one back.
//!
//! Three interchangeable strategies are implemented, selected at startup by
//! [`crate::config::OptimizerFunction`]:
//!
//! - [`Strategy::WorkloadAware`] (the default `optimize` strategy): fill
//!   pods at their default frequency first (Phase A), then degrade
//!   frequency on the pod with the most predicted headroom once no pod has
//!   room at the default rate (Phase B).
//! - [`Strategy::Uniform`]: round-robin agents across matching pods at the
//!   default frequency.
//! - [`Strategy::MostRemaining`]: always place on the pod with the most
//!   remaining workload, frequency pinned at default.
//!
//! The scratch fields the reference algorithm carries alongside each
//! service (`remainWorkload`, `predFreq`, `originalIndex`) never touch the
//! domain type here — they live in parallel `Vec<f64>` buffers indexed the
//! same way as the input `Vec<Service>`. Because entries are mutated in
//! place rather than re-sorted, input order and identity fall out for
//! free; a max-heap of `(key, index)` pairs picks the next candidate with
//! ties broken toward the smaller index (i.e. input order), matching the
//! reference implementation's repeated-stable-sort tie-break.

use std::collections::BinaryHeap;
use std::cmp::Ordering;

use crate::domain::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    WorkloadAware,
    Uniform,
    MostRemaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Success,
    Fail,
}

impl AllocationStatus {
    pub fn is_success(self) -> bool {
        matches!(self, AllocationStatus::Success)
    }
}

/// Run `strategy` against `services`, attempting to place `desired_count`
/// agents onto entries whose `service_type` matches. Entries of other
/// service types are returned untouched.
pub fn allocate(
    strategy: Strategy,
    service_type: &str,
    desired_count: u32,
    mut services: Vec<Service>,
) -> (AllocationStatus, Vec<Service>) {
    let status = match strategy {
        Strategy::WorkloadAware => workload_aware(service_type, desired_count, &mut services),
        Strategy::Uniform => uniform(service_type, desired_count, &mut services),
        Strategy::MostRemaining => most_remaining(service_type, desired_count, &mut services),
    };
    (status, services)
}

/// A candidate in the max-heap: `key` descending, ties broken by the
/// smallest `idx` (input order) comparing as greater.
#[derive(Debug, Clone, Copy)]
struct HeapItem {
    key: f64,
    idx: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.idx == other.idx
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

const EPS: f64 = 1e-9;

/// Pop heap entries until one is still current (its cached key matches the
/// live value in `keys`), discarding stale pushes along the way. This is
/// the lazy-deletion trick that lets us "decrease/increase a key" in a
/// `BinaryHeap` by just pushing the new value again.
fn pop_valid(heap: &mut BinaryHeap<HeapItem>, keys: &[f64]) -> Option<HeapItem> {
    while let Some(item) = heap.pop() {
        if (item.key - keys[item.idx]).abs() < EPS {
            return Some(item);
        }
    }
    None
}

fn workload_aware(service_type: &str, desired_count: u32, services: &mut [Service]) -> AllocationStatus {
    let n = services.len();
    let mut remain = vec![0.0_f64; n];
    let mut pred = vec![0.0_f64; n];
    let mut heap = BinaryHeap::new();

    for (i, svc) in services.iter_mut().enumerate() {
        if svc.service_type == service_type {
            svc.current_connection = 0;
        }
        remain[i] = svc.workload_limit - f64::from(svc.current_connection) * svc.frequency_limit.default;
        pred[i] = svc.workload_limit / f64::from(svc.current_connection + 1);
        if svc.service_type == service_type {
            heap.push(HeapItem { key: remain[i], idx: i });
        }
    }

    let mut placed = 0_u32;

    // Phase A: place at default frequency while there's room.
    while placed < desired_count {
        let Some(item) = pop_valid(&mut heap, &remain) else {
            break;
        };
        let i = item.idx;
        let default = services[i].frequency_limit.default;
        if remain[i] < default {
            break;
        }
        services[i].current_connection += 1;
        remain[i] -= default;
        services[i].current_frequency = default;
        pred[i] = services[i].workload_limit / f64::from(services[i].current_connection + 1);
        placed += 1;
        heap.push(HeapItem { key: remain[i], idx: i });
    }

    if placed == 0 {
        return AllocationStatus::Fail;
    }

    // Phase B: degrade frequency on the entry with the most headroom.
    let mut status = AllocationStatus::Success;
    let mut heap2 = BinaryHeap::new();
    for (i, svc) in services.iter().enumerate() {
        if svc.service_type == service_type {
            heap2.push(HeapItem { key: pred[i], idx: i });
        }
    }

    while placed < desired_count {
        let Some(item) = pop_valid(&mut heap2, &pred) else {
            break;
        };
        let i = item.idx;
        services[i].current_connection += 1;
        services[i].current_frequency = services[i].workload_limit / f64::from(services[i].current_connection);
        if services[i].current_frequency < services[i].frequency_limit.minimum {
            status = AllocationStatus::Fail;
        }
        pred[i] = services[i].workload_limit / f64::from(services[i].current_connection + 1);
        placed += 1;
        heap2.push(HeapItem { key: pred[i], idx: i });
    }

    status
}

fn uniform(service_type: &str, desired_count: u32, services: &mut [Service]) -> AllocationStatus {
    let mut targets = Vec::new();
    for (i, svc) in services.iter_mut().enumerate() {
        if svc.service_type == service_type {
            svc.current_connection = 0;
            svc.current_frequency = svc.frequency_limit.default;
            targets.push(i);
        }
    }
    if targets.is_empty() {
        return AllocationStatus::Fail;
    }
    for n in 0..desired_count {
        let i = targets[n as usize % targets.len()];
        services[i].current_connection += 1;
    }
    AllocationStatus::Success
}

fn most_remaining(service_type: &str, desired_count: u32, services: &mut [Service]) -> AllocationStatus {
    let n = services.len();
    let mut remain = vec![0.0_f64; n];
    let mut heap = BinaryHeap::new();

    for (i, svc) in services.iter_mut().enumerate() {
        if svc.service_type == service_type {
            svc.current_connection = 0;
            svc.current_frequency = svc.frequency_limit.default;
        }
        remain[i] = svc.workload_limit - f64::from(svc.current_connection) * svc.frequency_limit.default;
        if svc.service_type == service_type {
            heap.push(HeapItem { key: remain[i], idx: i });
        }
    }

    if heap.is_empty() {
        return AllocationStatus::Fail;
    }

    for _ in 0..desired_count {
        let Some(item) = pop_valid(&mut heap, &remain) else {
            break;
        };
        let i = item.idx;
        let default = services[i].frequency_limit.default;
        services[i].current_connection += 1;
        remain[i] -= default;
        heap.push(HeapItem { key: remain[i], idx: i });
    }

    AllocationStatus::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FrequencyLimit;

    fn svc(pod_ip: &str, host_port: u16, workload_limit: f64, default: f64, minimum: f64) -> Service {
        Service {
            pod_ip: pod_ip.to_string(),
            host_ip: "10.0.0.1".to_string(),
            host_port,
            node_name: "n1".to_string(),
            service_type: "pose".to_string(),
            current_connection: 0,
            frequency_limit: FrequencyLimit::new(default, minimum),
            current_frequency: default,
            workload_limit,
        }
    }

    /// S1: a single fresh pod, one agent subscribes at default frequency.
    #[test]
    fn s1_fresh_subscribe() {
        let services = vec![svc("10.0.0.1", 30500, 10.0, 5.0, 3.0)];
        let (status, out) = allocate(Strategy::WorkloadAware, "pose", 1, services);
        assert!(status.is_success());
        assert_eq!(out[0].current_connection, 1);
        assert_eq!(out[0].current_frequency, 5.0);
    }

    /// S2: two pods of very different capacity split 12 agents 2/10.
    #[test]
    fn s2_capacity_split() {
        let services = vec![
            svc("10.0.0.1", 1, 10.0, 5.0, 3.0),
            svc("10.0.0.2", 2, 50.0, 5.0, 3.0),
        ];
        let (status, out) = allocate(Strategy::WorkloadAware, "pose", 12, services);
        assert!(status.is_success());
        assert_eq!(out[0].current_connection, 2);
        assert_eq!(out[1].current_connection, 10);
        assert_eq!(out[0].current_frequency, 5.0);
        assert_eq!(out[1].current_frequency, 5.0);
    }

    /// S4: single pod, degraded placement once default-rate room runs out.
    #[test]
    fn s4_degraded_placement() {
        let services = vec![svc("10.0.0.1", 30500, 9.0, 5.0, 3.0)];
        let (status, out) = allocate(Strategy::WorkloadAware, "pose", 2, services);
        assert!(status.is_success());
        assert_eq!(out[0].current_connection, 2);
        assert_eq!(out[0].current_frequency, 4.5);
    }

    #[test]
    fn fails_below_minimum_frequency() {
        let services = vec![svc("10.0.0.1", 30500, 5.0, 5.0, 3.0)];
        let (status, out) = allocate(Strategy::WorkloadAware, "pose", 2, services);
        assert_eq!(status, AllocationStatus::Fail);
        // still places the agent, just flags infeasibility for the caller
        assert_eq!(out[0].current_connection, 2);
    }

    #[test]
    fn no_instance_of_service_type_fails() {
        let services = vec![svc("10.0.0.1", 30500, 10.0, 5.0, 3.0)];
        let (status, out) = allocate(Strategy::WorkloadAware, "gesture", 1, services.clone());
        assert_eq!(status, AllocationStatus::Fail);
        assert_eq!(out, services);
    }

    #[test]
    fn preserves_order_and_identity() {
        let services = vec![
            svc("a", 1, 5.0, 5.0, 3.0),
            svc("b", 2, 50.0, 5.0, 3.0),
            svc("c", 3, 20.0, 5.0, 3.0),
        ];
        let (_, out) = allocate(Strategy::WorkloadAware, "pose", 5, services.clone());
        assert_eq!(out.len(), services.len());
        for (a, b) in out.iter().zip(services.iter()) {
            assert_eq!(a.pod_ip, b.pod_ip);
        }
    }

    #[test]
    fn idempotent_when_rerun() {
        let services = vec![
            svc("a", 1, 17.0, 5.0, 3.0),
            svc("b", 2, 31.0, 5.0, 3.0),
        ];
        let (status1, out1) = allocate(Strategy::WorkloadAware, "pose", 7, services);
        let (status2, out2) = allocate(Strategy::WorkloadAware, "pose", 7, out1.clone());
        assert_eq!(status1, status2);
        assert_eq!(out1, out2);
    }

    #[test]
    fn uniform_round_robins() {
        let services = vec![
            svc("a", 1, 100.0, 5.0, 3.0),
            svc("b", 2, 100.0, 5.0, 3.0),
        ];
        let (status, out) = allocate(Strategy::Uniform, "pose", 5, services);
        assert!(status.is_success());
        assert_eq!(out[0].current_connection, 3);
        assert_eq!(out[1].current_connection, 2);
    }

    #[test]
    fn most_remaining_favors_largest_headroom() {
        let services = vec![
            svc("a", 1, 10.0, 5.0, 3.0),
            svc("b", 2, 50.0, 5.0, 3.0),
        ];
        let (status, out) = allocate(Strategy::MostRemaining, "pose", 4, services);
        assert!(status.is_success());
        assert_eq!(out[0].current_connection, 1);
        assert_eq!(out[1].current_connection, 3);
    }

    proptest::proptest! {
        #[test]
        fn feasibility_and_idempotence(
            limits in proptest::collection::vec((5.0_f64..200.0, 1u32..20), 1..6),
            want in 1u32..40,
        ) {
            let services: Vec<Service> = limits
                .iter()
                .enumerate()
                .map(|(i, (workload, port))| svc(&format!("pod-{i}"), *port as u16, *workload, 5.0, 3.0))
                .collect();

            let (status1, out1) = allocate(Strategy::WorkloadAware, "pose", want, services);
            for s in &out1 {
                if s.current_connection > 0 {
                    proptest::prop_assert!(
                        f64::from(s.current_connection) * s.frequency_limit.minimum <= s.workload_limit + EPS
                            || status1 == AllocationStatus::Fail
                    );
                }
            }
            let (status2, out2) = allocate(Strategy::WorkloadAware, "pose", want, out1.clone());
            proptest::prop_assert_eq!(status1, status2);
            proptest::prop_assert_eq!(out1, out2);
        }
    }
}
