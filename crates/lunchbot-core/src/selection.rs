// Fair venue selection.
//
// Venues picked within the last `window` runs are excluded. If that leaves
// nothing, the window shrinks one step at a time until something is
// eligible (window 0 excludes nothing, so any non-empty catalog yields a
// pick). Among the eligible venues the draw is weighted by
// 1 / (selection_count + 1) so rarely chosen venues come up more often.
//
// Picking is tentative: the catalog is never mutated here. The pick only
// sticks once the poll confirms it.

use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::catalog::RestaurantCatalog;
use crate::error::{LunchError, Result};
use crate::model::Venue;

pub struct SelectionEngine<R = StdRng> {
    window: usize,
    rng: R,
}

impl SelectionEngine<StdRng> {
    pub fn new(window: usize) -> Self {
        Self::with_rng(window, StdRng::from_entropy())
    }

    pub fn seeded(window: usize, seed: u64) -> Self {
        Self::with_rng(window, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> SelectionEngine<R> {
    pub fn with_rng(window: usize, rng: R) -> Self {
        Self { window, rng }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Propose today's venue.
    pub fn pick<'c>(&mut self, catalog: &'c RestaurantCatalog) -> Result<&'c Venue> {
        let (eligible, effective_window) = eligible_venues(catalog, self.window);
        if eligible.is_empty() {
            return Err(LunchError::NoEligibleVenue);
        }
        if effective_window < self.window {
            debug!(
                configured = self.window,
                effective = effective_window,
                "exclusion window relaxed to find an eligible venue"
            );
        }

        let weights = eligible
            .iter()
            .map(|v| 1.0 / (f64::from(v.selection_count) + 1.0));
        let dist = WeightedIndex::new(weights).map_err(|_| LunchError::NoEligibleVenue)?;
        let venue = eligible[dist.sample(&mut self.rng)];

        debug!(venue = %venue.id, candidates = eligible.len(), "venue proposed");
        Ok(venue)
    }
}

/// Venues not picked in the last `w` runs, for the largest `w <= window`
/// that leaves at least one. Also returns the `w` used.
pub fn eligible_venues(catalog: &RestaurantCatalog, window: usize) -> (Vec<&Venue>, usize) {
    for w in (0..=window).rev() {
        let excluded: HashSet<&str> = catalog
            .recent_picks(w)
            .iter()
            .map(String::as_str)
            .collect();
        let eligible: Vec<&Venue> = catalog
            .venues()
            .iter()
            .filter(|v| !excluded.contains(v.id.as_str()))
            .collect();
        if !eligible.is_empty() {
            return (eligible, w);
        }
    }
    (Vec::new(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::venue;
    use chrono::Utc;
    use std::collections::HashMap;

    fn catalog(ids: &[&str], history: &[&str]) -> RestaurantCatalog {
        RestaurantCatalog::new(
            ids.iter().map(|id| venue(id)).collect(),
            history.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn empty_catalog_fails_with_no_eligible_venue() {
        let mut engine = SelectionEngine::seeded(3, 1);
        let err = engine.pick(&RestaurantCatalog::default()).unwrap_err();
        assert!(matches!(err, LunchError::NoEligibleVenue));
    }

    #[test]
    fn excludes_recent_picks_in_window() {
        let mut engine = SelectionEngine::seeded(2, 7);
        let cat = catalog(&["a", "b", "c"], &["a", "b"]);
        for _ in 0..50 {
            assert_eq!(engine.pick(&cat).unwrap().id, "c");
        }
    }

    #[test]
    fn confirmed_pick_shifts_the_window() {
        let mut engine = SelectionEngine::seeded(2, 11);
        let mut cat = catalog(&["a", "b", "c"], &["a", "b"]);

        let first = engine.pick(&cat).unwrap().id.clone();
        assert_eq!(first, "c");
        cat.record_confirmed(&first, Utc::now());

        // History is now [a, b, c]; the last two (b, c) are excluded.
        assert_eq!(engine.pick(&cat).unwrap().id, "a");
    }

    #[test]
    fn pick_does_not_mutate_catalog() {
        let mut engine = SelectionEngine::seeded(1, 3);
        let cat = catalog(&["a", "b"], &["a"]);
        let before = cat.clone();
        engine.pick(&cat).unwrap();
        assert_eq!(cat, before);
    }

    #[test]
    fn window_relaxes_when_catalog_is_smaller_than_window() {
        // Both venues are inside a window of 3; the window shrinks to 1,
        // which still excludes the most recent pick.
        let mut engine = SelectionEngine::seeded(3, 5);
        let cat = catalog(&["a", "b"], &["a", "b"]);
        let (eligible, w) = eligible_venues(&cat, 3);
        assert_eq!(w, 1);
        assert_eq!(eligible.len(), 1);
        assert_eq!(engine.pick(&cat).unwrap().id, "a");
    }

    #[test]
    fn single_venue_catalog_always_terminates() {
        let mut engine = SelectionEngine::seeded(5, 9);
        let cat = catalog(&["only"], &["only", "only", "only"]);
        assert_eq!(engine.pick(&cat).unwrap().id, "only");
        assert_eq!(eligible_venues(&cat, 5).1, 0);
    }

    #[test]
    fn repeated_runs_never_repeat_within_window() {
        let window = 3;
        let mut engine = SelectionEngine::seeded(window, 42);
        let mut cat = catalog(&["a", "b", "c", "d", "e", "f"], &[]);

        for _ in 0..200 {
            let id = engine.pick(&cat).unwrap().id.clone();
            assert!(
                !cat.recent_picks(window).contains(&id),
                "{id} picked again within window {:?}",
                cat.recent_picks(window)
            );
            assert!(cat.get(&id).is_some());
            cat.record_confirmed(&id, Utc::now());
        }
    }

    #[test]
    fn less_chosen_venues_are_favoured() {
        let mut popular = venue("popular");
        popular.selection_count = 99;
        let rare = venue("rare");
        let cat = RestaurantCatalog::new(vec![popular, rare], vec![]);

        let mut engine = SelectionEngine::seeded(0, 1234);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            *counts.entry(engine.pick(&cat).unwrap().id.clone()).or_default() += 1;
        }
        // Expected ratio is 100:1 in favour of `rare`.
        assert!(counts.get("rare").copied().unwrap_or(0) > 900);
    }
}
