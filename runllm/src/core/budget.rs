//! Context budget guard.
//!
//! Token cost is estimated as one token per four characters, rounded up,
//! never below one. The heuristic is deliberately coarse and deterministic.

use serde_json::Value;

/// Estimated token count for a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

/// Estimated cost of an assembled prompt plus the serialized input payload.
pub fn estimate_context_tokens(prompt: &str, input: &Value) -> u64 {
    let input_text = serde_json::to_string(input).unwrap_or_default();
    estimate_tokens(&input_text) + estimate_tokens(prompt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExceeded {
    pub estimated: u64,
    pub ceiling: u64,
}

/// Declared ceiling for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub ceiling: u64,
}

impl ContextBudget {
    pub fn new(ceiling: u64) -> Self {
        Self { ceiling }
    }

    /// Returns the estimate when it fits under the ceiling.
    pub fn check(&self, prompt: &str, input: &Value) -> Result<u64, BudgetExceeded> {
        let estimated = estimate_context_tokens(prompt, input);
        if estimated > self.ceiling {
            return Err(BudgetExceeded {
                estimated,
                ceiling: self.ceiling,
            });
        }
        Ok(estimated)
    }
}
