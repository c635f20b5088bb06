//! Per-tick time budget for the main-thread finalize queue.
//!
//! Finalize steps of one kind cost roughly the same, so a moving average of
//! recent step costs predicts whether one more step still fits in the tick.

use std::time::{Duration, Instant};

/// Moving estimate of what one step costs.
#[derive(Clone, Debug)]
pub struct StepBudget {
    cost: Duration,
    /// Share of each new sample in the estimate.
    weight: f64,
}

impl StepBudget {
    pub fn new() -> StepBudget {
        StepBudget::with_weight(0.1)
    }

    /// Panics unless `0 < weight <= 1`.
    pub fn with_weight(weight: f64) -> StepBudget {
        assert!(weight > 0.0 && weight <= 1.0, "weight out of range");
        StepBudget {
            cost: Duration::from_secs(0),
            weight,
        }
    }

    pub fn estimated_step_cost(&self) -> Duration {
        self.cost
    }

    /// Call `step` while the next call is expected to end within `budget`.
    /// `step` returns false when it found nothing to do; that call isn't
    /// counted. The first call always happens. Returns how many steps ran.
    pub fn run<F: FnMut() -> bool>(&mut self, budget: Duration, mut step: F) -> usize {
        let start = Instant::now();
        let mut steps = 0;
        loop {
            if steps > 0 && start.elapsed() + self.cost >= budget {
                break;
            }
            let began = Instant::now();
            if !step() {
                break;
            }
            self.record(began.elapsed());
            steps += 1;
        }
        steps
    }

    fn record(&mut self, sample: Duration) {
        self.cost = self.cost.mul_f64(1.0 - self.weight) + sample.mul_f64(self.weight);
    }
}

impl Default for StepBudget {
    fn default() -> Self {
        StepBudget::new()
    }
}

#[cfg(test)]
mod tests {
    use super::StepBudget;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn one_step_even_when_over_budget() {
        let mut budget = StepBudget::new();
        budget.cost = Duration::from_secs(10);
        assert_eq!(budget.run(Duration::from_millis(0), || true), 1);
    }

    #[test]
    fn idle_calls_are_not_counted() {
        let mut budget = StepBudget::new();
        let mut queue = vec![1, 2, 3];
        let steps = budget.run(Duration::from_secs(10), || queue.pop().is_some());
        assert_eq!(steps, 3);
        assert!(queue.is_empty());
        assert_eq!(budget.run(Duration::from_secs(10), || false), 0);
    }

    #[test]
    fn slow_steps_are_cut_short() {
        let mut budget = StepBudget::with_weight(1.0);
        let steps = budget.run(Duration::from_millis(10), || {
            sleep(Duration::from_millis(4));
            true
        });
        assert!(steps >= 1 && steps <= 3, "{} steps", steps);
        assert!(budget.estimated_step_cost() >= Duration::from_millis(4));
    }

    #[test]
    fn estimate_moves_towards_samples() {
        let mut budget = StepBudget::with_weight(0.5);
        budget.record(Duration::from_millis(500));
        assert_eq!(budget.estimated_step_cost(), Duration::from_millis(250));
        budget.record(Duration::from_millis(500));
        assert_eq!(budget.estimated_step_cost(), Duration::from_millis(375));
    }
}
