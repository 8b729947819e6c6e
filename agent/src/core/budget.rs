//! Run-wide token budget.

use crate::core::types::Usage;

/// Run-wide token accounting against a fixed ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBudget {
    ceiling: u64,
    used: Usage,
}

impl TokenBudget {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            used: Usage::default(),
        }
    }

    pub fn record(&mut self, usage: Usage) {
        self.used.add(usage);
    }

    pub fn used(&self) -> Usage {
        self.used
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn exceeded(&self) -> bool {
        self.used.total() > self.ceiling
    }
}
