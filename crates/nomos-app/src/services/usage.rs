//! Token accounting reported by the completion endpoint.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Even share of the total attributed to each of `jobs` batch members.
    pub fn per_job(&self, jobs: usize) -> u64 {
        if jobs == 0 {
            return 0;
        }
        self.total_tokens() / jobs as u64
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_adds_totals() {
        let first = TokenUsage::new(100, 50);
        let second = TokenUsage::new(40, 10);
        let combined = first + second;
        assert_eq!(combined.prompt_tokens, 140);
        assert_eq!(combined.completion_tokens, 60);
        assert_eq!(combined.total_tokens(), 200);
    }

    #[test]
    fn per_job_share_divides_evenly() {
        let usage = TokenUsage::new(90, 10);
        assert_eq!(usage.per_job(4), 25);
        assert_eq!(usage.per_job(0), 0);
    }
}
