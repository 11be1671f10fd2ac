//! Concurrency cap for any search algorithm.

use bt_types::{Metrics, Mode, TuneResult};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::search::{SearchAlgorithm, SearchSpace, Suggestion};

/// Wraps a search algorithm and refuses to hand out more than
/// `max_concurrent` configurations that have not completed yet.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter<S> {
    inner: S,
    max_concurrent: usize,
    live: HashSet<Uuid>,
    name: String,
}

impl<S: SearchAlgorithm> ConcurrencyLimiter<S> {
    /// `max_concurrent` is clamped to at least one.
    pub fn new(inner: S, max_concurrent: usize) -> Self {
        let name = format!("{}(limit)", inner.name());
        Self {
            inner,
            max_concurrent: max_concurrent.max(1),
            live: HashSet::new(),
            name,
        }
    }

    pub fn live_trials(&self) -> usize {
        self.live.len()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: SearchAlgorithm> SearchAlgorithm for ConcurrencyLimiter<S> {
    fn set_search_properties(
        &mut self,
        metric: &str,
        mode: Mode,
        space: &SearchSpace,
    ) -> TuneResult<()> {
        self.inner.set_search_properties(metric, mode, space)
    }

    fn suggest(&mut self, trial_id: Uuid) -> TuneResult<Suggestion> {
        if self.live.len() >= self.max_concurrent {
            debug!(
                live = self.live.len(),
                limit = self.max_concurrent,
                "concurrency limit reached"
            );
            return Ok(Suggestion::Wait);
        }
        let suggestion = self.inner.suggest(trial_id)?;
        if matches!(suggestion, Suggestion::Config(_)) {
            self.live.insert(trial_id);
        }
        Ok(suggestion)
    }

    fn on_trial_result(&mut self, trial_id: Uuid, metrics: &Metrics) {
        self.inner.on_trial_result(trial_id, metrics);
    }

    fn on_trial_complete(&mut self, trial_id: Uuid, metrics: Option<&Metrics>, errored: bool) {
        self.live.remove(&trial_id);
        self.inner.on_trial_complete(trial_id, metrics, errored);
    }

    fn max_concurrent(&self) -> Option<usize> {
        let own = self.max_concurrent;
        Some(self.inner.max_concurrent().map_or(own, |inner| inner.min(own)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::RandomSearch;

    fn limiter(limit: usize) -> ConcurrencyLimiter<RandomSearch> {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        ConcurrencyLimiter::new(RandomSearch::new(space).with_seed(3), limit)
    }

    #[test]
    fn waits_once_limit_is_reached() {
        let mut lim = limiter(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(matches!(lim.suggest(a).unwrap(), Suggestion::Config(_)));
        assert!(matches!(lim.suggest(b).unwrap(), Suggestion::Config(_)));
        assert_eq!(lim.suggest(Uuid::new_v4()).unwrap(), Suggestion::Wait);
        assert_eq!(lim.live_trials(), 2);

        lim.on_trial_complete(a, None, false);
        assert!(matches!(
            lim.suggest(Uuid::new_v4()).unwrap(),
            Suggestion::Config(_)
        ));
    }

    #[test]
    fn errored_trials_free_their_slot() {
        let mut lim = limiter(1);
        let a = Uuid::new_v4();
        lim.suggest(a).unwrap();
        lim.on_trial_complete(a, None, true);
        assert_eq!(lim.live_trials(), 0);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let lim = limiter(0);
        assert_eq!(lim.max_concurrent(), Some(1));
        assert_eq!(lim.name(), "random(limit)");
    }
}
