// Budget tracker
// Running totals against a run's termination bounds, with threshold alerts.

use chrono::{DateTime, Utc};
use serde::Serialize;

use overseer_types::{FailureReason, Termination};

const WARNING_THRESHOLD: f64 = 0.8;

/// Outcome of a budget check
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheck {
    Ok,
    /// A dimension crossed the warning threshold; surfaced once per dimension
    Warning { dimension: &'static str, percentage: f64 },
    Exceeded { dimension: &'static str, reason: FailureReason },
}

/// Serializable view of the current totals
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub step_count: u64,
    pub max_steps: u64,
    pub cost_usd: f64,
    pub max_cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub elapsed_secs: u64,
    pub timeout_seconds: u64,
}

/// Per-run totals. Counters are monotone while the run lives; the engine
/// owns one tracker per active run.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    bounds: Termination,
    started_at: DateTime<Utc>,
    step_count: u64,
    cost_usd: f64,
    tokens_in: u64,
    tokens_out: u64,
    warned_steps: bool,
    warned_cost: bool,
    warned_time: bool,
}

impl BudgetTracker {
    pub fn new(bounds: Termination, started_at: DateTime<Utc>) -> Self {
        Self {
            bounds,
            started_at,
            step_count: 0,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            warned_steps: false,
            warned_cost: false,
            warned_time: false,
        }
    }

    pub fn record_tool_call(&mut self, cost_usd: Option<f64>) {
        self.step_count += 1;
        if let Some(cost) = cost_usd {
            if cost > 0.0 {
                self.cost_usd += cost;
            }
        }
    }

    pub fn record_cost(&mut self, cost_usd: f64) {
        if cost_usd > 0.0 {
            self.cost_usd += cost_usd;
        }
    }

    pub fn record_tokens(&mut self, tokens_in: u64, tokens_out: u64) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn tokens(&self) -> (u64, u64) {
        (self.tokens_in, self.tokens_out)
    }

    /// Evaluate the bounds at `now`. Exceeded dimensions are reported in the
    /// fixed order steps, cost, time; warnings fire once each.
    pub fn check(&mut self, now: DateTime<Utc>) -> BudgetCheck {
        let elapsed_secs = (now - self.started_at).num_seconds().max(0) as u64;

        if self.bounds.max_steps > 0 && self.step_count >= self.bounds.max_steps {
            return BudgetCheck::Exceeded {
                dimension: "steps",
                reason: FailureReason::MaxSteps,
            };
        }
        if self.bounds.max_cost > 0.0 && self.cost_usd >= self.bounds.max_cost {
            return BudgetCheck::Exceeded {
                dimension: "cost",
                reason: FailureReason::MaxCost,
            };
        }
        if self.bounds.timeout_seconds > 0 && elapsed_secs >= self.bounds.timeout_seconds {
            return BudgetCheck::Exceeded {
                dimension: "time",
                reason: FailureReason::Timeout,
            };
        }

        if !self.warned_steps && self.bounds.max_steps > 0 {
            let pct = self.step_count as f64 / self.bounds.max_steps as f64;
            if pct >= WARNING_THRESHOLD {
                self.warned_steps = true;
                return BudgetCheck::Warning {
                    dimension: "steps",
                    percentage: pct,
                };
            }
        }
        if !self.warned_cost && self.bounds.max_cost > 0.0 {
            let pct = self.cost_usd / self.bounds.max_cost;
            if pct >= WARNING_THRESHOLD {
                self.warned_cost = true;
                return BudgetCheck::Warning {
                    dimension: "cost",
                    percentage: pct,
                };
            }
        }
        if !self.warned_time && self.bounds.timeout_seconds > 0 {
            let pct = elapsed_secs as f64 / self.bounds.timeout_seconds as f64;
            if pct >= WARNING_THRESHOLD {
                self.warned_time = true;
                return BudgetCheck::Warning {
                    dimension: "time",
                    percentage: pct,
                };
            }
        }

        BudgetCheck::Ok
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        BudgetSnapshot {
            step_count: self.step_count,
            max_steps: self.bounds.max_steps,
            cost_usd: self.cost_usd,
            max_cost: self.bounds.max_cost,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            elapsed_secs: (now - self.started_at).num_seconds().max(0) as u64,
            timeout_seconds: self.bounds.timeout_seconds,
        }
    }
}
