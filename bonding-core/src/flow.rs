//! Flow tracking for flow-hashed policies.
//!
//! A flow is identified by a 32-bit hash of the traffic 5-tuple computed by the
//! caller. Each flow is pinned to one nominated path so that its packets are
//! not reordered across links.

use std::collections::HashMap;

/// Caller-computed flow hash.
pub type FlowId = i32;

/// One tracked flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    id: FlowId,
    bytes_in: u64,
    bytes_out: u64,
    created: i64,
    last_activity: i64,
    last_reassignment: i64,
    assigned: Option<usize>,
    previously_assigned: Option<usize>,
}

impl Flow {
    pub fn new(id: FlowId, now: i64) -> Self {
        Self {
            id,
            bytes_in: 0,
            bytes_out: 0,
            created: now,
            last_activity: now,
            last_reassignment: 0,
            assigned: None,
            previously_assigned: None,
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity
    }

    pub fn last_reassignment(&self) -> i64 {
        self.last_reassignment
    }

    /// Time since the flow last carried traffic.
    pub fn age(&self, now: i64) -> i64 {
        now - self.last_activity
    }

    /// Nominated slot index the flow is pinned to.
    pub fn assigned(&self) -> Option<usize> {
        self.assigned
    }

    pub fn previously_assigned(&self) -> Option<usize> {
        self.previously_assigned
    }

    /// Pin the flow to `slot`, remembering where it was before.
    pub fn assign(&mut self, slot: usize, now: i64) {
        if self.assigned != Some(slot) {
            self.previously_assigned = self.assigned;
        }
        self.assigned = Some(slot);
        self.last_reassignment = now;
    }

    /// Drop the pin, returning the slot it pointed at.
    pub fn unassign(&mut self) -> Option<usize> {
        let previous = self.assigned.take();
        if previous.is_some() {
            self.previously_assigned = previous;
        }
        previous
    }

    pub fn record_in(&mut self, bytes: u16, now: i64) {
        self.bytes_in += u64::from(bytes);
        self.last_activity = now;
    }

    pub fn record_out(&mut self, bytes: u16, now: i64) {
        self.bytes_out += u64::from(bytes);
        self.last_activity = now;
    }

    pub fn touch(&mut self, now: i64) {
        self.last_activity = now;
    }

    pub fn reset_byte_counts(&mut self) {
        self.bytes_in = 0;
        self.bytes_out = 0;
    }
}

/// Bounded map of flows. Inserting beyond capacity evicts the flow that has
/// been idle the longest.
#[derive(Debug)]
pub struct FlowTable {
    flows: HashMap<FlowId, Flow>,
    capacity: usize,
}

impl FlowTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            flows: HashMap::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn contains(&self, id: FlowId) -> bool {
        self.flows.contains_key(&id)
    }

    pub fn get(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(&id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut Flow> {
        self.flows.get_mut(&id)
    }

    /// Insert a new flow, returning whichever flow had to make room for it.
    pub fn insert(&mut self, flow: Flow) -> Option<Flow> {
        let evicted = if !self.flows.contains_key(&flow.id) && self.flows.len() >= self.capacity {
            self.oldest().and_then(|id| self.flows.remove(&id))
        } else {
            None
        };
        self.flows.insert(flow.id, flow);
        evicted
    }

    pub fn remove(&mut self, id: FlowId) -> Option<Flow> {
        self.flows.remove(&id)
    }

    /// Least recently active flow; ties go to the lowest id.
    pub fn oldest(&self) -> Option<FlowId> {
        self.flows
            .values()
            .min_by_key(|flow| (flow.last_activity, flow.id))
            .map(|flow| flow.id)
    }

    /// Remove every flow idle for longer than `max_age`.
    pub fn expire(&mut self, now: i64, max_age: i64) -> Vec<Flow> {
        let stale: Vec<FlowId> = self
            .flows
            .values()
            .filter(|flow| flow.age(now) > max_age)
            .map(|flow| flow.id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.flows.remove(&id))
            .collect()
    }

    pub fn reset_byte_counts(&mut self) {
        for flow in self.flows.values_mut() {
            flow.reset_byte_counts();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Flow> {
        self.flows.values_mut()
    }

    pub fn clear(&mut self) {
        self.flows.clear();
    }
}
