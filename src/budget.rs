//! Resource budget tracker
//!
//! Three abstract pools (cpu, memory, network) gate parallel dispatch.
//! Reservations are all-or-nothing and serialized by a single mutex.

use crate::models::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};

const EPSILON: f64 = 1e-9;

/// Units a node holds while it runs
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceCost {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

impl ResourceCost {
    pub const fn new(cpu: f64, memory: f64, network: f64) -> Self {
        Self { cpu, memory, network }
    }

    /// Minimal cost charged to nodes of unknown type, so omitting hints
    /// never bypasses admission
    pub const MINIMAL: ResourceCost = ResourceCost::new(1.0, 256.0, 10.0);

    /// Base cost of a node type
    pub fn for_type(node_type: &str) -> Self {
        match node_type {
            "llm" => Self::new(2.0, 1024.0, 200.0),
            "rag_retriever" | "retriever" => Self::new(1.5, 512.0, 100.0),
            "classifier" => Self::new(1.0, 256.0, 50.0),
            "data_transformer" => Self::new(0.5, 128.0, 20.0),
            "code_executor" => Self::new(1.0, 512.0, 10.0),
            "condition" => Self::new(0.1, 64.0, 5.0),
            "input" | "output" => Self::new(0.1, 32.0, 5.0),
            _ => Self::MINIMAL,
        }
    }

    /// Cost of a node: type default, scaled per `*_intensive` hint,
    /// replaced per pool by numeric `cpu`/`memory`/`network` weights.
    ///
    /// An intensity hint of `true` doubles the pool; a positive number
    /// multiplies it by that factor.
    pub fn for_node(node: &Node) -> Self {
        let mut cost = Self::for_type(&node.node_type);
        let factor = |key: &str| match node.config.get(key) {
            Some(Value::Bool(true)) => Some(2.0),
            Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite() && *f > 0.0),
            _ => None,
        };
        let weight = |key: &str| node.config.get(key).and_then(Value::as_f64).filter(|w| *w >= 0.0);

        if let Some(f) = factor("cpu_intensive") {
            cost.cpu *= f;
        }
        if let Some(f) = factor("memory_intensive") {
            cost.memory *= f;
        }
        if let Some(f) = factor("network_intensive") {
            cost.network *= f;
        }

        if let Some(cpu) = weight("cpu") {
            cost.cpu = cpu;
        }
        if let Some(memory) = weight("memory") {
            cost.memory = memory;
        }
        if let Some(network) = weight("network") {
            cost.network = network;
        }

        cost
    }

    fn fits(&self, available: &ResourceCost) -> bool {
        self.cpu <= available.cpu + EPSILON
            && self.memory <= available.memory + EPSILON
            && self.network <= available.network + EPSILON
    }

    fn add(&mut self, other: &ResourceCost) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.network += other.network;
    }

    fn sub_clamped(&mut self, other: &ResourceCost) {
        let clamp = |v: f64| if v < EPSILON { 0.0 } else { v };
        self.cpu = clamp(self.cpu - other.cpu);
        self.memory = clamp(self.memory - other.memory);
        self.network = clamp(self.network - other.network);
    }
}

/// Configured pool totals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCapacity {
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_memory")]
    pub memory: f64,
    #[serde(default = "default_network")]
    pub network: f64,
}

fn default_cpu() -> f64 {
    8.0
}

fn default_memory() -> f64 {
    8192.0
}

fn default_network() -> f64 {
    1000.0
}

impl Default for BudgetCapacity {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            network: default_network(),
        }
    }
}

/// Fraction of each pool currently reserved
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetUtilization {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

/// Reservation accounting since the budget was created
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub reservations: u64,
    pub releases: u64,
    pub outstanding: ResourceCost,
}

impl BudgetLedger {
    /// True when every reservation has been released
    pub fn is_balanced(&self) -> bool {
        self.reservations == self.releases
            && self.outstanding.cpu.abs() < EPSILON
            && self.outstanding.memory.abs() < EPSILON
            && self.outstanding.network.abs() < EPSILON
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    reserved: ResourceCost,
    reservations: u64,
    releases: u64,
}

/// Shared resource budget
#[derive(Debug)]
pub struct ResourceBudget {
    capacity: BudgetCapacity,
    state: Mutex<BudgetState>,
}

impl ResourceBudget {
    pub fn new(capacity: BudgetCapacity) -> Self {
        Self {
            capacity,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn capacity(&self) -> BudgetCapacity {
        self.capacity
    }

    // Plain counters stay consistent even if a holder panicked
    fn state(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `cost` if every pool has room. Reserves nothing otherwise.
    pub fn try_reserve(&self, cost: &ResourceCost) -> bool {
        let mut state = self.state();
        let available = ResourceCost::new(
            self.capacity.cpu - state.reserved.cpu,
            self.capacity.memory - state.reserved.memory,
            self.capacity.network - state.reserved.network,
        );

        if !cost.fits(&available) {
            return false;
        }

        state.reserved.add(cost);
        state.reservations += 1;
        true
    }

    /// Return a previously reserved cost
    pub fn release(&self, cost: &ResourceCost) {
        let mut state = self.state();
        state.reserved.sub_clamped(cost);
        state.releases += 1;
    }

    /// Whether `cost` could be granted on an idle budget
    pub fn can_ever_fit(&self, cost: &ResourceCost) -> bool {
        cost.fits(&ResourceCost::new(
            self.capacity.cpu,
            self.capacity.memory,
            self.capacity.network,
        ))
    }

    pub fn reserved(&self) -> ResourceCost {
        self.state().reserved
    }

    pub fn utilization(&self) -> BudgetUtilization {
        let reserved = self.reserved();
        let ratio = |used: f64, total: f64| if total > 0.0 { used / total } else { 0.0 };
        BudgetUtilization {
            cpu: ratio(reserved.cpu, self.capacity.cpu),
            memory: ratio(reserved.memory, self.capacity.memory),
            network: ratio(reserved.network, self.capacity.network),
        }
    }

    pub fn ledger(&self) -> BudgetLedger {
        let state = self.state();
        BudgetLedger {
            reservations: state.reservations,
            releases: state.releases,
            outstanding: state.reserved,
        }
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::new(BudgetCapacity::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn node(node_type: &str, config: Value) -> Node {
        serde_json::from_value(json!({
            "id": "n",
            "type": node_type,
            "config": config,
        }))
        .unwrap()
    }

    #[test]
    fn test_cost_from_type_and_hints() {
        assert_eq!(ResourceCost::for_node(&node("llm", json!({}))), ResourceCost::new(2.0, 1024.0, 200.0));
        assert_eq!(ResourceCost::for_node(&node("custom", json!({}))), ResourceCost::MINIMAL);

        let doubled = ResourceCost::for_node(&node("llm", json!({"cpu_intensive": true})));
        assert_eq!(doubled.cpu, 4.0);
        assert_eq!(doubled.memory, 1024.0);

        let weighted = ResourceCost::for_node(&node("llm", json!({"cpu_intensive": true, "cpu": 0.5})));
        assert_eq!(weighted.cpu, 0.5);
    }

    #[test]
    fn test_numeric_intensity_scales_cost() {
        let scaled = ResourceCost::for_node(&node("llm", json!({"cpu_intensive": 3, "network_intensive": 1.5})));
        assert_eq!(scaled.cpu, 6.0);
        assert_eq!(scaled.memory, 1024.0);
        assert_eq!(scaled.network, 300.0);

        let ignored = ResourceCost::for_node(&node("llm", json!({"memory_intensive": 0, "cpu_intensive": false})));
        assert_eq!(ignored, ResourceCost::new(2.0, 1024.0, 200.0));
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let budget = ResourceBudget::new(BudgetCapacity {
            cpu: 4.0,
            memory: 1000.0,
            network: 100.0,
        });

        assert!(budget.try_reserve(&ResourceCost::new(2.0, 900.0, 10.0)));
        // cpu fits, memory does not
        assert!(!budget.try_reserve(&ResourceCost::new(1.0, 200.0, 10.0)));
        assert_eq!(budget.reserved(), ResourceCost::new(2.0, 900.0, 10.0));

        budget.release(&ResourceCost::new(2.0, 900.0, 10.0));
        assert!(budget.try_reserve(&ResourceCost::new(1.0, 200.0, 10.0)));
    }

    #[test]
    fn test_ledger_balances_after_release() {
        let budget = ResourceBudget::default();
        let cost = ResourceCost::new(0.1, 32.0, 5.0);
        for _ in 0..10 {
            assert!(budget.try_reserve(&cost));
        }
        assert!(!budget.ledger().is_balanced());
        for _ in 0..10 {
            budget.release(&cost);
        }
        assert!(budget.ledger().is_balanced());
    }

    #[test]
    fn test_can_ever_fit() {
        let budget = ResourceBudget::default();
        assert!(budget.can_ever_fit(&ResourceCost::new(8.0, 8192.0, 1000.0)));
        assert!(!budget.can_ever_fit(&ResourceCost::new(9.0, 1.0, 1.0)));
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let budget = Arc::new(ResourceBudget::new(BudgetCapacity {
            cpu: 5.0,
            memory: 10_000.0,
            network: 10_000.0,
        }));
        let cost = ResourceCost::new(1.0, 1.0, 1.0);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || budget.try_reserve(&cost))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 5);
        assert!(budget.reserved().cpu <= 5.0);
        assert_eq!(budget.ledger().reservations, 5);
    }

    #[test]
    fn test_utilization() {
        let budget = ResourceBudget::default();
        assert!(budget.try_reserve(&ResourceCost::new(4.0, 2048.0, 0.0)));
        let util = budget.utilization();
        assert_eq!(util.cpu, 0.5);
        assert_eq!(util.memory, 0.25);
        assert_eq!(util.network, 0.0);
    }
}
