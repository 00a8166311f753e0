use crate::events::{
    ConditionSnapshot, Emission, OperandSnapshot, OutputEvent, ViolationKind, ViolationReport,
};
use crate::sched::{TimerHeap, TimerKind};
use crate::signals::{SignalMap, SignalStore};
use crate::types::{NodeId, NodeKind, Program, Timestamp, Truth, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ─── Monitor runtime ──────────────────────────────────────────

/// Lifecycle phase of a monitored condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorPhase {
    Idle,
    AwaitStart,
    InWindow,
    Satisfied,
    Violated,
    Cancelled,
}

#[derive(Clone, Debug)]
struct MonitorRuntime {
    phase: MonitorPhase,
    arm_time: Timestamp,
    /// Bumped on every transition; outstanding timers carry the epoch
    /// that scheduled them and are ignored once it moves on.
    epoch: u64,
}

#[derive(Clone, Debug)]
struct NodeState {
    armed: bool,
    last_truth: Truth,
    /// Sticky completion flag (cleared on disarm): a plain condition is
    /// done after its first rising edge, a monitored one on Satisfied,
    /// a sequence when its cursor runs off the end, a parallel when all
    /// children are done.
    done: bool,
    /// Sequence nodes only: index of the next child to arm.
    cursor: usize,
    monitor: Option<MonitorRuntime>,
}

// ─── Policy engine ────────────────────────────────────────────

/// The policy manager: owns the compiled rule tree, the signal store, and
/// the timer heap, and turns input events plus elapsed logical time into
/// emissions and violation reports. Strictly single-threaded; the driver
/// is the only caller.
pub struct PolicyEngine {
    program: Program,
    map: Option<SignalMap>,
    store: SignalStore,
    timers: TimerHeap,
    states: Vec<NodeState>,
    out: Vec<OutputEvent>,
}

impl PolicyEngine {
    pub fn new(program: Program, map: Option<SignalMap>) -> Self {
        let states = (0..program.nodes.len())
            .map(|id| NodeState {
                armed: false,
                last_truth: Truth::Unknown,
                done: false,
                cursor: 0,
                monitor: program.is_monitored(id).then(|| MonitorRuntime {
                    phase: MonitorPhase::Idle,
                    arm_time: 0,
                    epoch: 0,
                }),
            })
            .collect();
        Self {
            program,
            map,
            store: SignalStore::new(),
            timers: TimerHeap::new(),
            states,
            out: Vec::new(),
        }
    }

    /// Arm the top-level rules. Unconditional emits fire exactly once
    /// here; 0-delay ones release before this returns.
    pub fn start(&mut self, now: Timestamp) -> Vec<OutputEvent> {
        for root in self.program.roots.clone() {
            match &self.program.nodes[root].kind {
                NodeKind::Emit { .. } => self.fire_emit(root, now),
                NodeKind::Condition { .. } => self.arm_condition(root, now),
                NodeKind::Parallel { .. } | NodeKind::Sequence { .. } => {
                    self.arm_wrapper(root, now)
                }
            }
        }
        self.drain_due(now);
        std::mem::take(&mut self.out)
    }

    /// Feed one input event. Propagation runs to completion, then timers
    /// due at `now` (including 0-delay emissions) are dispatched.
    pub fn inject(&mut self, name: &str, value: Value, now: Timestamp) -> Vec<OutputEvent> {
        let changed = self.store.set(name, value, now);
        debug!(signal = name, changed, at = now, "input");
        self.propagate(name, now);
        self.drain_due(now);
        std::mem::take(&mut self.out)
    }

    /// Advance logical time, dispatching every timer due by `now`.
    pub fn advance(&mut self, now: Timestamp) -> Vec<OutputEvent> {
        self.drain_due(now);
        std::mem::take(&mut self.out)
    }

    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    pub fn signal_map(&self) -> Option<&SignalMap> {
        self.map.as_ref()
    }

    pub fn value_of(&self, name: &str) -> Value {
        self.store.get(name)
    }

    /// Monitor phase of the condition at `path`, for inspection.
    pub fn monitor_phase(&self, path: &str) -> Option<MonitorPhase> {
        let id = self.program.node_by_path(path)?;
        self.states[id].monitor.as_ref().map(|m| m.phase)
    }

    // ─── Propagation ──────────────────────────────────────────

    fn propagate(&mut self, name: &str, now: Timestamp) {
        let Some(subscribers) = self.program.subscriptions.get(name).cloned() else {
            return;
        };
        // Subscriber lists are in pre-order by construction.
        for id in subscribers {
            if self.states[id].armed {
                self.reevaluate(id, now);
            } else {
                debug!(node = self.program.path(id), "not armed, skipped");
            }
        }
    }

    fn reevaluate(&mut self, id: NodeId, now: Timestamp) {
        let NodeKind::Condition { expr, .. } = &self.program.nodes[id].kind else {
            return;
        };
        let value = expr.eval(&self.store);
        if value.is_undefined() {
            debug!(node = self.program.path(id), "expression undefined");
        }
        let truth = Truth::of(&value);
        let prev = self.states[id].last_truth;
        self.states[id].last_truth = truth;
        match (prev.is_true(), truth.is_true()) {
            (false, true) => self.on_rising(id, now),
            (true, false) => self.on_falling(id, now),
            _ => {}
        }
    }

    fn on_rising(&mut self, id: NodeId, now: Timestamp) {
        debug!(node = self.program.path(id), at = now, "rising");
        if self.states[id].monitor.is_some() {
            // Monitored conditions defer their emit children to the
            // monitor; other children still arm on the edge.
            self.monitor_expr_true(id, now);
            self.arm_children(id, now, false);
        } else {
            self.arm_children(id, now, true);
            self.mark_complete(id, now);
        }
    }

    fn on_falling(&mut self, id: NodeId, now: Timestamp) {
        debug!(node = self.program.path(id), at = now, "falling");
        if self.states[id].monitor.is_some() {
            self.monitor_expr_false(id, now);
        }
        for child in self.program.nodes[id].kind.children().to_vec() {
            self.disarm_subtree(child, now);
        }
    }

    /// Arm child subtrees in document order; `fire_emits` is false for
    /// monitored conditions, whose emits wait for Satisfied.
    fn arm_children(&mut self, id: NodeId, now: Timestamp, fire_emits: bool) {
        for child in self.program.nodes[id].kind.children().to_vec() {
            match &self.program.nodes[child].kind {
                NodeKind::Emit { .. } => {
                    if fire_emits {
                        self.fire_emit(child, now);
                    }
                }
                NodeKind::Condition { .. } => self.arm_condition(child, now),
                NodeKind::Parallel { .. } | NodeKind::Sequence { .. } => {
                    self.arm_wrapper(child, now)
                }
            }
        }
    }

    /// Arming never evaluates: the node's truth is Unknown until a signal
    /// event re-evaluates it while armed.
    fn arm_condition(&mut self, id: NodeId, now: Timestamp) {
        let start_ms = self.start_ms(id);
        let state = &mut self.states[id];
        state.armed = true;
        state.last_truth = Truth::Unknown;
        state.done = false;
        if let Some(monitor) = state.monitor.as_mut() {
            monitor.epoch += 1;
            monitor.phase = MonitorPhase::AwaitStart;
            monitor.arm_time = now;
            let epoch = monitor.epoch;
            self.timers.schedule(
                now + start_ms,
                TimerKind::MonitorStart { node: id, epoch },
            );
        }
        debug!(node = self.program.path(id), at = now, "armed");
    }

    fn arm_wrapper(&mut self, id: NodeId, now: Timestamp) {
        self.states[id].armed = true;
        self.states[id].done = false;
        match &self.program.nodes[id].kind {
            NodeKind::Parallel { children } => {
                for child in children.clone() {
                    self.arm_node(child, now);
                }
            }
            NodeKind::Sequence { children } => {
                self.states[id].cursor = 0;
                if let Some(&first) = children.first() {
                    self.arm_node(first, now);
                }
            }
            _ => {}
        }
    }

    fn arm_node(&mut self, id: NodeId, now: Timestamp) {
        match &self.program.nodes[id].kind {
            NodeKind::Condition { .. } => self.arm_condition(id, now),
            NodeKind::Parallel { .. } | NodeKind::Sequence { .. } => self.arm_wrapper(id, now),
            NodeKind::Emit { .. } => {}
        }
    }

    /// Falling-edge cleanup below a condition: disarm, cancel descendant
    /// monitors and pending emissions, reset sequence cursors. Idempotent.
    fn disarm_subtree(&mut self, id: NodeId, now: Timestamp) {
        match &self.program.nodes[id].kind {
            NodeKind::Emit { .. } => {
                self.timers
                    .cancel_matching(|k| matches!(k, TimerKind::Emission { node, .. } if *node == id));
            }
            NodeKind::Condition { .. } => {
                let state = &mut self.states[id];
                state.armed = false;
                state.last_truth = Truth::Unknown;
                state.done = false;
                if let Some(monitor) = state.monitor.as_mut() {
                    if matches!(
                        monitor.phase,
                        MonitorPhase::AwaitStart | MonitorPhase::InWindow
                    ) {
                        monitor.epoch += 1;
                        monitor.phase = MonitorPhase::Cancelled;
                        debug!(node = self.program.path(id), at = now, "monitor cancelled");
                    }
                }
                for child in self.program.nodes[id].kind.children().to_vec() {
                    self.disarm_subtree(child, now);
                }
            }
            NodeKind::Parallel { .. } | NodeKind::Sequence { .. } => {
                self.states[id].armed = false;
                self.states[id].done = false;
                self.states[id].cursor = 0;
                for child in self.program.nodes[id].kind.children().to_vec() {
                    self.disarm_subtree(child, now);
                }
            }
        }
    }

    // ─── Completion & sequence gating ─────────────────────────

    fn mark_complete(&mut self, id: NodeId, now: Timestamp) {
        if self.states[id].done {
            return;
        }
        self.states[id].done = true;
        let Some(parent) = self.program.nodes[id].parent else {
            return;
        };
        if !self.states[parent].armed {
            return;
        }
        let parent_kind = self.program.nodes[parent].kind.clone();
        match parent_kind {
            NodeKind::Sequence { children } => {
                let cursor = self.states[parent].cursor;
                if children.get(cursor) == Some(&id) {
                    // Finished children are retired quietly: no falling
                    // actions, pending emissions stay scheduled.
                    self.states[id].armed = false;
                    self.states[parent].cursor = cursor + 1;
                    debug!(
                        node = self.program.path(parent),
                        cursor = cursor + 1,
                        "sequence advanced"
                    );
                    match children.get(cursor + 1) {
                        Some(&next) => self.arm_node(next, now),
                        None => self.mark_complete(parent, now),
                    }
                }
            }
            NodeKind::Parallel { children } => {
                if children.iter().all(|c| self.states[*c].done) {
                    self.mark_complete(parent, now);
                }
            }
            _ => {}
        }
    }

    // ─── Monitor state machine ────────────────────────────────

    fn monitor_expr_true(&mut self, id: NodeId, now: Timestamp) {
        let (start_ms, stop_ms) = self.timing(id);
        let monitor = self.states[id].monitor.as_mut().unwrap();
        if monitor.phase != MonitorPhase::AwaitStart {
            // Oscillation after a terminal phase never re-emits.
            debug!(node = self.program.path(id), phase = ?monitor.phase, "edge ignored");
            return;
        }
        monitor.epoch += 1;
        match stop_ms {
            Some(stop) => {
                monitor.phase = MonitorPhase::InWindow;
                let deadline = monitor.arm_time + start_ms + stop;
                let epoch = monitor.epoch;
                self.timers
                    .schedule(deadline, TimerKind::MonitorStop { node: id, epoch });
                debug!(node = self.program.path(id), deadline, "in window");
            }
            None => {
                monitor.phase = MonitorPhase::Satisfied;
                self.satisfy(id, now);
            }
        }
    }

    fn monitor_expr_false(&mut self, id: NodeId, now: Timestamp) {
        let monitor = self.states[id].monitor.as_mut().unwrap();
        if monitor.phase == MonitorPhase::InWindow {
            monitor.epoch += 1;
            monitor.phase = MonitorPhase::Violated;
            self.report_violation(id, ViolationKind::FalseWithinStopWindow, now);
        }
    }

    fn on_monitor_start(&mut self, id: NodeId, epoch: u64, at: Timestamp) {
        let Some(monitor) = self.states[id].monitor.as_mut() else {
            return;
        };
        if monitor.epoch != epoch || monitor.phase != MonitorPhase::AwaitStart {
            return; // stale timer
        }
        monitor.epoch += 1;
        monitor.phase = MonitorPhase::Violated;
        self.report_violation(id, ViolationKind::StartWindowExpired, at);
    }

    fn on_monitor_stop(&mut self, id: NodeId, epoch: u64, at: Timestamp) {
        let Some(monitor) = self.states[id].monitor.as_mut() else {
            return;
        };
        if monitor.epoch != epoch || monitor.phase != MonitorPhase::InWindow {
            return; // stale timer
        }
        monitor.epoch += 1;
        monitor.phase = MonitorPhase::Satisfied;
        self.satisfy(id, at);
    }

    /// Satisfied: fire the emit child if present, then bubble completion
    /// (advancing an enclosing sequence cursor if this was its head).
    fn satisfy(&mut self, id: NodeId, now: Timestamp) {
        debug!(node = self.program.path(id), at = now, "satisfied");
        for child in self.program.nodes[id].kind.children().to_vec() {
            if matches!(self.program.nodes[child].kind, NodeKind::Emit { .. }) {
                self.fire_emit(child, now);
            }
        }
        self.mark_complete(id, now);
    }

    fn report_violation(&mut self, id: NodeId, kind: ViolationKind, at: Timestamp) {
        let report = ViolationReport {
            at,
            kind,
            condition: self.snapshot_condition(id),
            ancestors: self
                .program
                .ancestor_conditions(id)
                .into_iter()
                .map(|a| self.snapshot_condition(a))
                .collect(),
        };
        debug!(node = self.program.path(id), ?kind, at, "violation");
        self.out.push(OutputEvent::Violation(report));
    }

    fn snapshot_condition(&self, id: NodeId) -> ConditionSnapshot {
        let NodeKind::Condition { expr, text, .. } = &self.program.nodes[id].kind else {
            unreachable!("snapshots are only taken of conditions");
        };
        ConditionSnapshot {
            path: self.program.path(id).to_string(),
            expr: text.clone(),
            operands: expr
                .operands()
                .into_iter()
                .map(|name| {
                    let value = self.store.get(&name);
                    OperandSnapshot { name, value }
                })
                .collect(),
        }
    }

    // ─── Emission pipeline ────────────────────────────────────

    fn fire_emit(&mut self, id: NodeId, now: Timestamp) {
        let (value, signal, delay_ms) = {
            let NodeKind::Emit {
                signal,
                value,
                delay_ms,
            } = &self.program.nodes[id].kind
            else {
                return;
            };
            (value.eval(&self.store), signal.clone(), *delay_ms)
        };
        if value.is_undefined() {
            debug!(node = self.program.path(id), "emit value undefined, dropped");
            return;
        }
        debug!(
            node = self.program.path(id),
            signal = %signal,
            release = now + delay_ms,
            "emission scheduled"
        );
        self.timers.schedule(
            now + delay_ms,
            TimerKind::Emission {
                node: id,
                signal,
                value,
            },
        );
    }

    fn release_emission(&mut self, signal: String, value: Value, at: Timestamp) {
        let changed = self.store.set(&signal, value.clone(), at);
        debug!(signal = %signal, changed, at, "emission released");
        let id = self.map.as_ref().and_then(|m| m.id_of(&signal));
        self.out.push(OutputEvent::Emission(Emission {
            at,
            name: signal.clone(),
            id,
            value,
        }));
        // Downstream rules see the new value in the same tick.
        self.propagate(&signal, at);
    }

    // ─── Timer dispatch ───────────────────────────────────────

    fn drain_due(&mut self, now: Timestamp) {
        while let Some((deadline, kind)) = self.timers.pop_due(now) {
            match kind {
                TimerKind::MonitorStart { node, epoch } => {
                    self.on_monitor_start(node, epoch, deadline)
                }
                TimerKind::MonitorStop { node, epoch } => {
                    self.on_monitor_stop(node, epoch, deadline)
                }
                TimerKind::Emission { signal, value, .. } => {
                    self.release_emission(signal, value, deadline)
                }
            }
        }
    }

    fn timing(&self, id: NodeId) -> (u64, Option<u64>) {
        match &self.program.nodes[id].kind {
            NodeKind::Condition {
                start_ms, stop_ms, ..
            } => (start_ms.unwrap_or(0), *stop_ms),
            _ => (0, None),
        }
    }

    fn start_ms(&self, id: NodeId) -> u64 {
        self.timing(id).0
    }
}
