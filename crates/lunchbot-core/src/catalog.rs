// In-memory view of the candidate venues and the order they were picked in.
//
// The durable copy lives in the database (`Database::load_catalog`); a
// catalog is loaded fresh for every run and handed to the SelectionEngine.

use chrono::{DateTime, Utc};

use crate::model::{Venue, VenueId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestaurantCatalog {
    venues: Vec<Venue>,
    /// Confirmed picks, oldest first.
    history: Vec<VenueId>,
}

impl RestaurantCatalog {
    pub fn new(venues: Vec<Venue>, history: Vec<VenueId>) -> Self {
        Self { venues, history }
    }

    pub fn venues(&self) -> &[Venue] {
        &self.venues
    }

    pub fn history(&self) -> &[VenueId] {
        &self.history
    }

    pub fn get(&self, id: &str) -> Option<&Venue> {
        self.venues.iter().find(|v| v.id == id)
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }

    /// The last `n` confirmed picks (fewer if the history is shorter).
    pub fn recent_picks(&self, n: usize) -> &[VenueId] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Apply a confirmed pick to this in-memory copy. Returns false when the
    /// venue is not part of the catalog.
    pub fn record_confirmed(&mut self, venue_id: &str, at: DateTime<Utc>) -> bool {
        let Some(venue) = self.venues.iter_mut().find(|v| v.id == venue_id) else {
            return false;
        };
        venue.selection_count += 1;
        venue.last_chosen_at = Some(at);
        self.history.push(venue_id.to_string());
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::DeliveryType;

    /// Helper: a venue with no selection history.
    pub(crate) fn venue(id: &str) -> Venue {
        Venue {
            id: id.to_string(),
            name: id.to_uppercase(),
            emoji: id.to_string(),
            instructions: String::new(),
            delivery: DeliveryType::Delivery,
            price_per_person_cents: None,
            last_chosen_at: None,
            selection_count: 0,
        }
    }

    #[test]
    fn recent_picks_returns_tail_of_history() {
        let catalog = RestaurantCatalog::new(
            vec![venue("a"), venue("b"), venue("c")],
            vec!["a".into(), "b".into(), "c".into()],
        );
        assert_eq!(catalog.recent_picks(2), &["b".to_string(), "c".to_string()]);
        assert_eq!(catalog.recent_picks(0), &[] as &[String]);
        assert_eq!(catalog.recent_picks(10).len(), 3);
    }

    #[test]
    fn record_confirmed_updates_counts_and_history() {
        let mut catalog = RestaurantCatalog::new(vec![venue("a"), venue("b")], vec![]);
        let at = Utc::now();

        assert!(catalog.record_confirmed("b", at));
        let b = catalog.get("b").unwrap();
        assert_eq!(b.selection_count, 1);
        assert_eq!(b.last_chosen_at, Some(at));
        assert_eq!(catalog.history(), &["b".to_string()]);

        assert!(!catalog.record_confirmed("zzz", at));
        assert_eq!(catalog.history().len(), 1);
    }
}
