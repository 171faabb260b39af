use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation flag shared between a caller and a running search.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Limits applied to one search. Checked between chunks; the budget is
/// checked per candidate.
#[derive(Debug, Clone, Default)]
pub struct SearchControl {
    pub cancel: Option<CancelToken>,
    /// Maximum number of candidates to examine.
    pub budget: Option<u64>,
    pub deadline: Option<Instant>,
}

impl SearchControl {
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    pub(crate) fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn token_clones_share_state() {
        let token = CancelToken::new();
        let control = SearchControl::default().with_cancel(token.clone());
        assert!(!control.is_cancelled());
        token.cancel();
        assert!(control.is_cancelled());
    }

    #[test]
    fn deadline_in_the_past_has_passed() {
        let control = SearchControl::default().with_deadline(Instant::now());
        assert!(control.past_deadline());
        let later = SearchControl::default().with_deadline(Instant::now() + Duration::from_secs(60));
        assert!(!later.past_deadline());
    }
}
