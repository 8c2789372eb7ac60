use std::collections::VecDeque;

/// Result of one backend call as seen by a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Fixed-capacity ring of the most recent call outcomes.
///
/// Pushing into a full window evicts the oldest sample. The failure count is
/// maintained incrementally so `failure_rate` is O(1).
#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    samples: VecDeque<CallOutcome>,
    capacity: usize,
    failures: usize,
}

impl OutcomeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            failures: 0,
        }
    }

    pub fn push(&mut self, outcome: CallOutcome) {
        if self.samples.len() == self.capacity {
            if let Some(CallOutcome::Failure) = self.samples.pop_front() {
                self.failures -= 1;
            }
        }
        if outcome == CallOutcome::Failure {
            self.failures += 1;
        }
        self.samples.push_back(outcome);
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Failure percentage over the buffered samples, 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.failures as f64 * 100.0 / self.samples.len() as f64
    }
}
