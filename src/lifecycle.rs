//! Backend lifecycle state machine
//!
//! [`LifecycleMachine`] holds the pure transition logic and takes explicit
//! instants, so every timing rule can be driven deterministically.
//! [`LifecycleOrchestrator`] wraps it for concurrent use: it ticks on a fixed
//! interval, re-evaluates as soon as a new health snapshot lands, publishes
//! each state as an immutable value, and forwards start/stop requests over an
//! outbound channel without waiting on them.

use crate::config::LifecycleConfig;
use crate::healthcheck::HealthSnapshot;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Kind of lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// Nothing observed yet
    Unknown,
    /// Backend is reachable
    Active,
    /// Backend is unreachable and nobody asked for it
    Inactive,
    /// A start was requested, waiting for the backend to come up
    Starting,
    /// A stop was requested, waiting for the backend to go away
    Stopping,
    /// The last login attempt was rejected
    Unauthorized,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Unknown => "unknown",
            StateKind::Active => "active",
            StateKind::Inactive => "inactive",
            StateKind::Starting => "starting",
            StateKind::Stopping => "stopping",
            StateKind::Unauthorized => "unauthorized",
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state and when it was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    pub kind: StateKind,
    pub entered_at: Instant,
}

impl LifecycleState {
    pub fn new(kind: StateKind, entered_at: Instant) -> Self {
        Self { kind, entered_at }
    }

    /// Time spent in this state as of `now`
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }
}

/// Requests sent to the command invoker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    RequestStart,
    RequestStop,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestStart => "request-start",
            LifecycleEvent::RequestStop => "request-stop",
        }
    }

    /// Name of the configured command that serves this event
    pub fn command(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestStart => "start",
            LifecycleEvent::RequestStop => "shutdown",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Last observed player count and when it changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerActivity {
    pub last_known_count: u32,
    pub changed_at: Instant,
}

/// Timing policy
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Zero-player time before requesting shutdown
    pub idle_timeout: Duration,
    /// How long Starting/Stopping may last before the watchdog acts
    pub transition_timeout: Duration,
    /// Interval between evaluations
    pub tick_interval: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            transition_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl From<&LifecycleConfig> for LifecyclePolicy {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            transition_timeout: config.transition_timeout(),
            tick_interval: config.tick_interval(),
        }
    }
}

/// The transition function, free of clocks and I/O
#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    state: LifecycleState,
    players: PlayerActivity,
    policy: LifecyclePolicy,
}

impl LifecycleMachine {
    pub fn new(policy: LifecyclePolicy, now: Instant) -> Self {
        Self {
            state: LifecycleState::new(StateKind::Unknown, now),
            players: PlayerActivity {
                last_known_count: 0,
                changed_at: now,
            },
            policy,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn players(&self) -> PlayerActivity {
        self.players
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Move to `kind`. Without `force`, a move to the current kind does
    /// nothing. Returns true when the state was replaced.
    pub fn transition(
        &mut self,
        kind: StateKind,
        force: bool,
        now: Instant,
        events: &mut Vec<LifecycleEvent>,
    ) -> bool {
        if self.state.kind == kind && !force {
            return false;
        }

        info!(from = %self.state.kind, to = %kind, forced = force, "Lifecycle state changed");
        self.state = LifecycleState::new(kind, now);

        match kind {
            StateKind::Starting => events.push(LifecycleEvent::RequestStart),
            StateKind::Stopping => events.push(LifecycleEvent::RequestStop),
            _ => {}
        }
        true
    }

    /// One evaluation against the freshest snapshot
    pub fn evaluate(&mut self, health: &HealthSnapshot, now: Instant) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let timeout = self.policy.transition_timeout;

        // Watchdog: never hang in a transitional state
        match self.state.kind {
            StateKind::Stopping if self.state.elapsed_at(now) > timeout => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "Stopping timed out, retrying"
                );
                self.transition(StateKind::Stopping, true, now, &mut events);
            }
            StateKind::Starting if self.state.elapsed_at(now) > timeout => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "Starting timed out, aborting"
                );
                self.transition(StateKind::Inactive, false, now, &mut events);
            }
            _ => {}
        }

        // Reachability, except while an intentional transition is underway
        if health.reachable && self.state.kind != StateKind::Stopping {
            self.transition(StateKind::Active, false, now, &mut events);
        } else if !health.reachable && self.state.kind != StateKind::Starting {
            self.transition(StateKind::Inactive, false, now, &mut events);
        }

        if self.state.kind == StateKind::Active {
            self.evaluate_idle(health, now, &mut events);
        }

        events
    }

    fn evaluate_idle(
        &mut self,
        health: &HealthSnapshot,
        now: Instant,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let count = health.online_players();
        if count != self.players.last_known_count {
            info!(
                from = self.players.last_known_count,
                to = count,
                "Player count changed"
            );
            self.players = PlayerActivity {
                last_known_count: count,
                changed_at: now,
            };
        }

        let idle_since = self.players.changed_at.max(self.state.entered_at);
        if self.players.last_known_count == 0
            && now.saturating_duration_since(idle_since) >= self.policy.idle_timeout
        {
            info!(
                idle_secs = now.saturating_duration_since(idle_since).as_secs(),
                "No players are connected, stopping server"
            );
            self.transition(StateKind::Stopping, false, now, events);
        }
    }

    /// A completed login while the backend is unreachable
    pub fn login(&mut self, authorized: bool, now: Instant) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let kind = if authorized {
            StateKind::Starting
        } else {
            StateKind::Unauthorized
        };
        self.transition(kind, false, now, &mut events);
        events
    }
}

/// Shared, ticking owner of the [`LifecycleMachine`]
pub struct LifecycleOrchestrator {
    machine: Mutex<LifecycleMachine>,
    state_tx: watch::Sender<LifecycleState>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    health_rx: watch::Receiver<Arc<HealthSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleOrchestrator {
    pub fn new(
        policy: LifecyclePolicy,
        health_rx: watch::Receiver<Arc<HealthSnapshot>>,
        events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Arc<Self> {
        let machine = LifecycleMachine::new(policy, Instant::now());
        let (state_tx, _) = watch::channel(machine.state());
        Arc::new(Self {
            machine: Mutex::new(machine),
            state_tx,
            events_tx,
            health_rx,
            task: Mutex::new(None),
        })
    }

    /// The current state
    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state replacement
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Evaluate now
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Evaluate as of `now` against the freshest health snapshot
    pub fn tick_at(&self, now: Instant) {
        let health = self.health_rx.borrow().clone();
        self.apply(|machine| machine.evaluate(&health, now));
    }

    /// Record a login attempt. Returns the resulting state.
    pub fn on_login(&self, authorized: bool) -> LifecycleState {
        self.on_login_at(authorized, Instant::now())
    }

    pub fn on_login_at(&self, authorized: bool, now: Instant) -> LifecycleState {
        self.apply(|machine| machine.login(authorized, now))
    }

    fn apply<F>(&self, f: F) -> LifecycleState
    where
        F: FnOnce(&mut LifecycleMachine) -> Vec<LifecycleEvent>,
    {
        let mut machine = self.machine.lock();
        let before = machine.state();
        let events = f(&mut machine);
        let after = machine.state();

        if after != before {
            self.state_tx.send_replace(after);
        }
        for event in events {
            debug!(event = %event, "Dispatching lifecycle event");
            if self.events_tx.send(event).is_err() {
                warn!(event = %event, "No command invoker is listening, event dropped");
            }
        }
        after
    }

    /// Start ticking. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let interval = self.machine.lock().policy().tick_interval;
        info!(
            tick_ms = interval.as_millis() as u64,
            "Lifecycle orchestrator started"
        );

        let orchestrator = Arc::clone(self);
        let mut health_rx = self.health_rx.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut watching_health = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = health_rx.changed(), if watching_health => {
                        if changed.is_err() {
                            watching_health = false;
                        }
                    }
                }
                orchestrator.tick();
            }
        }));
    }

    /// Stop ticking. Idempotent.
    pub fn close(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Lifecycle orchestrator stopped");
        }
    }
}
