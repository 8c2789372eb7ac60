use crate::config::CircuitBreakerConfig;
use crate::upstream::window::{CallOutcome, OutcomeWindow};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// One breaker per name. Routes get a breaker named after their route id
/// unless the filter names one explicitly, in which case routes naming the
/// same breaker share its state.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<RouteBreaker>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerMode::Closed => "CLOSED",
            BreakerMode::Open => "OPEN",
            BreakerMode::HalfOpen => "HALF_OPEN",
        }
    }

    fn gauge(&self) -> f64 {
        match self {
            BreakerMode::Closed => 0.0,
            BreakerMode::Open => 1.0,
            BreakerMode::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed {
        window: OutcomeWindow,
    },
    Open {
        opened_at: Instant,
    },
    HalfOpen {
        /// Trial permits not yet handed out.
        remaining: u32,
        successes: u32,
        window: OutcomeWindow,
    },
}

/// Result of asking the breaker whether a call may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Permitted { generation: u64, trial: bool },
    Rejected,
}

/// The pure transition function of one breaker. Time is always passed in.
///
/// Every transition bumps `generation`. Permits carry the generation they
/// were issued in, and outcomes from an older generation are discarded so a
/// slow call from a previous phase cannot close or reopen the breaker.
#[derive(Debug)]
pub struct BreakerCore {
    settings: CircuitBreakerConfig,
    state: BreakerState,
    generation: u64,
}

impl BreakerCore {
    pub fn new(settings: CircuitBreakerConfig) -> Self {
        let window = OutcomeWindow::new(settings.sliding_window_size);
        Self {
            settings,
            state: BreakerState::Closed { window },
            generation: 0,
        }
    }

    pub fn mode(&self) -> BreakerMode {
        match self.state {
            BreakerState::Closed { .. } => BreakerMode::Closed,
            BreakerState::Open { .. } => BreakerMode::Open,
            BreakerState::HalfOpen { .. } => BreakerMode::HalfOpen,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Admit or reject one call. An open breaker whose wait has elapsed moves
    /// to half-open here, and the call that observed it takes the first trial.
    /// Returns the admission plus the mode the breaker moved to, if any.
    pub fn try_acquire(&mut self, now: Instant) -> (Admission, Option<BreakerMode>) {
        match &mut self.state {
            BreakerState::Closed { .. } => (
                Admission::Permitted {
                    generation: self.generation,
                    trial: false,
                },
                None,
            ),
            BreakerState::Open { opened_at } => {
                if now.saturating_duration_since(*opened_at) < self.settings.wait_duration {
                    return (Admission::Rejected, None);
                }
                let permitted = self.settings.permitted_half_open_calls.max(1);
                self.state = BreakerState::HalfOpen {
                    remaining: permitted - 1,
                    successes: 0,
                    window: OutcomeWindow::new(permitted as usize),
                };
                self.generation += 1;
                (
                    Admission::Permitted {
                        generation: self.generation,
                        trial: true,
                    },
                    Some(BreakerMode::HalfOpen),
                )
            }
            BreakerState::HalfOpen { remaining, .. } => {
                if *remaining == 0 {
                    return (Admission::Rejected, None);
                }
                *remaining -= 1;
                (
                    Admission::Permitted {
                        generation: self.generation,
                        trial: true,
                    },
                    None,
                )
            }
        }
    }

    /// Record the outcome of a call admitted in `generation`.
    pub fn on_outcome(
        &mut self,
        generation: u64,
        outcome: CallOutcome,
        now: Instant,
    ) -> Option<BreakerMode> {
        if generation != self.generation {
            return None;
        }
        let next = match &mut self.state {
            BreakerState::Closed { window } => {
                window.push(outcome);
                if window.is_full()
                    && window.failure_rate() >= self.settings.failure_rate_threshold
                {
                    BreakerState::Open { opened_at: now }
                } else {
                    return None;
                }
            }
            BreakerState::HalfOpen {
                successes, window, ..
            } => {
                window.push(outcome);
                match outcome {
                    CallOutcome::Failure => BreakerState::Open { opened_at: now },
                    CallOutcome::Success => {
                        *successes += 1;
                        if *successes < self.settings.permitted_half_open_calls.max(1) {
                            return None;
                        }
                        BreakerState::Closed {
                            window: OutcomeWindow::new(self.settings.sliding_window_size),
                        }
                    }
                }
            }
            BreakerState::Open { .. } => return None,
        };
        self.state = next;
        self.generation += 1;
        Some(self.mode())
    }

    /// Hand back a trial slot whose call never produced an outcome.
    pub fn release(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let BreakerState::HalfOpen { remaining, .. } = &mut self.state {
            *remaining += 1;
        }
    }

    fn snapshot(&self, name: &str) -> BreakerSnapshot {
        let (window, remaining_trials) = match &self.state {
            BreakerState::Closed { window } => (Some(window), 0),
            BreakerState::Open { .. } => (None, 0),
            BreakerState::HalfOpen {
                remaining, window, ..
            } => (Some(window), *remaining),
        };
        BreakerSnapshot {
            name: name.to_string(),
            state: self.mode().as_str(),
            failure_rate: window.map(|w| w.failure_rate()).unwrap_or(0.0),
            buffered_calls: window.map(|w| w.len()).unwrap_or(0),
            failed_calls: window.map(|w| w.failures()).unwrap_or(0),
            remaining_trials,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: &'static str,
    pub failure_rate: f64,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub remaining_trials: u32,
}

/// A named breaker guarding one or more routes.
pub struct RouteBreaker {
    name: String,
    settings: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
}

impl std::fmt::Debug for RouteBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBreaker")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

impl RouteBreaker {
    pub fn new(name: impl Into<String>, settings: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics::gauge!("gateway_circuit_breaker_state", "breaker" => name.clone())
            .set(BreakerMode::Closed.gauge());
        Self {
            name,
            core: Mutex::new(BreakerCore::new(settings.clone())),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CircuitBreakerConfig {
        &self.settings
    }

    pub fn mode(&self) -> BreakerMode {
        self.lock().mode()
    }

    /// Whether a response status counts as a failure sample.
    pub fn is_failure_status(&self, status: u16) -> bool {
        self.settings.failure_statuses.contains(&status)
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(self: &Arc<Self>, now: Instant) -> Option<CallPermit> {
        let (admission, moved) = self.lock().try_acquire(now);
        if let Some(mode) = moved {
            self.on_transition(mode);
        }
        match admission {
            Admission::Permitted { generation, trial } => Some(CallPermit {
                breaker: Arc::clone(self),
                generation,
                trial,
                settled: false,
            }),
            Admission::Rejected => {
                metrics::counter!("gateway_circuit_breaker_rejected_total", "breaker" => self.name.clone())
                    .increment(1);
                None
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.lock().snapshot(&self.name)
    }

    fn record(&self, generation: u64, outcome: CallOutcome, now: Instant) {
        let moved = self.lock().on_outcome(generation, outcome, now);
        if let Some(mode) = moved {
            self.on_transition(mode);
        }
    }

    fn release(&self, generation: u64) {
        self.lock().release(generation);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_transition(&self, mode: BreakerMode) {
        match mode {
            BreakerMode::Open => tracing::warn!(
                breaker = %self.name,
                wait = ?self.settings.wait_duration,
                "circuit_breaker: opened"
            ),
            BreakerMode::HalfOpen => tracing::info!(
                breaker = %self.name,
                trials = self.settings.permitted_half_open_calls,
                "circuit_breaker: half-open, admitting trial calls"
            ),
            BreakerMode::Closed => {
                tracing::info!(breaker = %self.name, "circuit_breaker: closed (recovered)")
            }
        }
        metrics::counter!(
            "gateway_circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => mode.as_str()
        )
        .increment(1);
        metrics::gauge!("gateway_circuit_breaker_state", "breaker" => self.name.clone())
            .set(mode.gauge());
    }
}

/// Permission for exactly one backend call. Recording consumes the permit;
/// dropping it unrecorded returns a half-open trial slot.
pub struct CallPermit {
    breaker: Arc<RouteBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn breaker(&self) -> &RouteBreaker {
        &self.breaker
    }

    pub fn record(self, outcome: CallOutcome) {
        self.record_at(outcome, Instant::now());
    }

    pub fn record_at(mut self, outcome: CallOutcome, now: Instant) {
        self.settled = true;
        self.breaker.record(self.generation, outcome, now);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Return the breaker called `name`, creating it with `settings` on
    /// first use. Later callers share the first caller's settings.
    pub fn get_or_create(&self, name: &str, settings: &CircuitBreakerConfig) -> Arc<RouteBreaker> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.breakers.get(name) {
            if entry.settings() != settings {
                tracing::warn!(
                    breaker = name,
                    "circuit_breaker: shared breaker keeps the settings it was created with"
                );
            }
            return entry.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RouteBreaker::new(name, settings.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RouteBreaker>> {
        self.breakers.get(name).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(window: usize, trials: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: window,
            failure_rate_threshold: 50.0,
            wait_duration: Duration::from_secs(10),
            permitted_half_open_calls: trials,
            failure_statuses: vec![500, 502, 503, 504],
        }
    }

    fn permit(core: &mut BreakerCore, now: Instant) -> u64 {
        match core.try_acquire(now).0 {
            Admission::Permitted { generation, .. } => generation,
            Admission::Rejected => panic!("expected a permit"),
        }
    }

    fn trip(core: &mut BreakerCore, now: Instant) {
        for _ in 0..core.settings.sliding_window_size {
            let g = permit(core, now);
            core.on_outcome(g, CallOutcome::Failure, now);
        }
        assert_eq!(core.mode(), BreakerMode::Open);
    }

    #[test]
    fn test_starts_closed() {
        let mut core = BreakerCore::new(settings(10, 5));
        assert_eq!(core.mode(), BreakerMode::Closed);
        assert!(matches!(
            core.try_acquire(Instant::now()).0,
            Admission::Permitted { trial: false, .. }
        ));
    }

    #[test]
    fn test_opens_after_window_of_failures() {
        let mut core = BreakerCore::new(settings(10, 5));
        let now = Instant::now();
        for i in 0..9 {
            let g = permit(&mut core, now);
            assert_eq!(core.on_outcome(g, CallOutcome::Failure, now), None, "call {}", i);
        }
        assert_eq!(core.mode(), BreakerMode::Closed);

        let g = permit(&mut core, now);
        assert_eq!(
            core.on_outcome(g, CallOutcome::Failure, now),
            Some(BreakerMode::Open)
        );
        assert_eq!(core.try_acquire(now).0, Admission::Rejected);
    }

    #[test]
    fn test_threshold_evaluated_only_when_full() {
        let mut core = BreakerCore::new(settings(4, 1));
        let now = Instant::now();
        for outcome in [CallOutcome::Failure, CallOutcome::Failure, CallOutcome::Success] {
            let g = permit(&mut core, now);
            core.on_outcome(g, outcome, now);
        }
        assert_eq!(core.mode(), BreakerMode::Closed);

        let g = permit(&mut core, now);
        core.on_outcome(g, CallOutcome::Success, now);
        // 2 of 4 is exactly 50%.
        assert_eq!(core.mode(), BreakerMode::Open);
    }

    #[test]
    fn test_below_threshold_stays_closed() {
        let mut core = BreakerCore::new(settings(4, 1));
        let now = Instant::now();
        for outcome in [
            CallOutcome::Failure,
            CallOutcome::Success,
            CallOutcome::Success,
            CallOutcome::Success,
            CallOutcome::Failure,
            CallOutcome::Success,
        ] {
            let g = permit(&mut core, now);
            core.on_outcome(g, outcome, now);
        }
        assert_eq!(core.mode(), BreakerMode::Closed);
    }

    #[test]
    fn test_successes_leave_closed_breaker_unchanged() {
        let mut core = BreakerCore::new(settings(2, 1));
        let now = Instant::now();
        for _ in 0..5 {
            let g = permit(&mut core, now);
            assert_eq!(core.on_outcome(g, CallOutcome::Success, now), None);
        }
        assert_eq!(core.mode(), BreakerMode::Closed);
        assert_eq!(core.generation(), 0);
    }

    #[test]
    fn test_half_open_only_after_wait() {
        let mut core = BreakerCore::new(settings(2, 3));
        let t0 = Instant::now();
        trip(&mut core, t0);

        assert_eq!(
            core.try_acquire(t0 + Duration::from_millis(9_999)).0,
            Admission::Rejected
        );
        assert_eq!(core.mode(), BreakerMode::Open);

        let (admission, moved) = core.try_acquire(t0 + Duration::from_secs(10));
        assert!(matches!(admission, Admission::Permitted { trial: true, .. }));
        assert_eq!(moved, Some(BreakerMode::HalfOpen));
    }

    #[test]
    fn test_half_open_limits_trials() {
        let mut core = BreakerCore::new(settings(2, 3));
        let t0 = Instant::now();
        trip(&mut core, t0);
        let later = t0 + Duration::from_secs(11);

        let admitted = (0..10)
            .filter(|_| matches!(core.try_acquire(later).0, Admission::Permitted { .. }))
            .count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut core = BreakerCore::new(settings(2, 3));
        let t0 = Instant::now();
        trip(&mut core, t0);
        let later = t0 + Duration::from_secs(10);

        let first = permit(&mut core, later);
        let second = permit(&mut core, later);
        core.on_outcome(first, CallOutcome::Success, later);
        assert_eq!(
            core.on_outcome(second, CallOutcome::Failure, later),
            Some(BreakerMode::Open)
        );

        // The new open period starts at `later`.
        assert_eq!(
            core.try_acquire(later + Duration::from_secs(5)).0,
            Admission::Rejected
        );
        assert!(matches!(
            core.try_acquire(later + Duration::from_secs(10)).0,
            Admission::Permitted { trial: true, .. }
        ));
    }

    #[test]
    fn test_half_open_successes_close() {
        let mut core = BreakerCore::new(settings(2, 3));
        let t0 = Instant::now();
        trip(&mut core, t0);
        let later = t0 + Duration::from_secs(10);

        let gens: Vec<u64> = (0..3).map(|_| permit(&mut core, later)).collect();
        assert_eq!(core.on_outcome(gens[0], CallOutcome::Success, later), None);
        assert_eq!(core.on_outcome(gens[1], CallOutcome::Success, later), None);
        assert_eq!(
            core.on_outcome(gens[2], CallOutcome::Success, later),
            Some(BreakerMode::Closed)
        );

        // Fresh window: a single failure does not reopen.
        let g = permit(&mut core, later);
        assert_eq!(core.on_outcome(g, CallOutcome::Failure, later), None);
        assert_eq!(core.mode(), BreakerMode::Closed);
    }

    #[test]
    fn test_stale_outcome_ignored() {
        let mut core = BreakerCore::new(settings(2, 1));
        let t0 = Instant::now();
        let slow = permit(&mut core, t0);
        trip(&mut core, t0);
        let later = t0 + Duration::from_secs(10);
        let _trial = permit(&mut core, later);

        // A closed-phase call finishing during half-open must not close it.
        assert_eq!(core.on_outcome(slow, CallOutcome::Success, later), None);
        assert_eq!(core.mode(), BreakerMode::HalfOpen);
    }

    #[test]
    fn test_release_returns_trial_slot() {
        let mut core = BreakerCore::new(settings(2, 1));
        let t0 = Instant::now();
        trip(&mut core, t0);
        let later = t0 + Duration::from_secs(10);

        let g = permit(&mut core, later);
        assert_eq!(core.try_acquire(later).0, Admission::Rejected);
        core.release(g);
        assert!(matches!(core.try_acquire(later).0, Admission::Permitted { .. }));
    }

    #[test]
    fn test_dropped_permit_releases_slot() {
        let breaker = Arc::new(RouteBreaker::new("cart", settings(1, 1)));
        let t0 = Instant::now();
        breaker
            .try_acquire_at(t0)
            .unwrap()
            .record_at(CallOutcome::Failure, t0);
        assert_eq!(breaker.mode(), BreakerMode::Open);

        let later = t0 + Duration::from_secs(10);
        let trial = breaker.try_acquire_at(later).unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire_at(later).is_none());
        drop(trial);
        assert!(breaker.try_acquire_at(later).is_some());
    }

    #[test]
    fn test_route_breaker_snapshot() {
        let breaker = Arc::new(RouteBreaker::new("products", settings(4, 2)));
        let now = Instant::now();
        breaker.try_acquire_at(now).unwrap().record_at(CallOutcome::Failure, now);
        breaker.try_acquire_at(now).unwrap().record_at(CallOutcome::Success, now);

        let snap = breaker.snapshot();
        assert_eq!(snap.name, "products");
        assert_eq!(snap.state, "CLOSED");
        assert_eq!(snap.buffered_calls, 2);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.failure_rate, 50.0);
    }

    #[test]
    fn test_failure_status_classification() {
        let breaker = RouteBreaker::new("b", settings(2, 1));
        assert!(breaker.is_failure_status(503));
        assert!(!breaker.is_failure_status(404));
        assert!(!breaker.is_failure_status(200));
    }

    #[test]
    fn test_registry_shares_by_name() {
        let reg = CircuitBreakerRegistry::new();
        let a = reg.get_or_create("shared", &settings(2, 1));
        let b = reg.get_or_create("shared", &settings(8, 4));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.settings().sliding_window_size, 2);

        reg.get_or_create("alpha", &settings(2, 1));
        let names: Vec<String> = reg.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "shared"]);
    }

    #[test]
    fn test_breakers_are_independent() {
        let reg = CircuitBreakerRegistry::new();
        let a = reg.get_or_create("a", &settings(1, 1));
        let b = reg.get_or_create("b", &settings(1, 1));
        a.try_acquire().unwrap().record(CallOutcome::Failure);
        assert_eq!(a.mode(), BreakerMode::Open);
        assert_eq!(b.mode(), BreakerMode::Closed);
    }
}
