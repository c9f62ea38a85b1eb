use std::collections::{HashMap, HashSet};

use carwatch_core::{ListingSnapshot, ScrapedListing};
use chrono::{DateTime, Utc};

/// Output of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Every snapshot observed this cycle, updated or new, one per listing id.
    pub to_persist: Vec<ListingSnapshot>,
    /// New listings and price drops; the subset screened against rules.
    pub changed: Vec<ListingSnapshot>,
}

/// Reconciles live listings against the stored snapshots of one partition.
///
/// Stored snapshots with no live counterpart are left alone and appear in neither output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DiffEngine {
    pub fn reconcile(&self, stored: Vec<ListingSnapshot>, live: &[ScrapedListing]) -> Reconciliation {
        self.reconcile_at(stored, live, Utc::now())
    }

    pub fn reconcile_at(
        &self,
        stored: Vec<ListingSnapshot>,
        live: &[ScrapedListing],
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let mut known: HashMap<String, ListingSnapshot> = stored
            .into_iter()
            .map(|snapshot| (snapshot.id.clone(), snapshot))
            .collect();
        let mut observed_order: Vec<String> = Vec::new();
        let mut observed: HashSet<String> = HashSet::new();
        let mut changed: HashSet<String> = HashSet::new();

        for listing in live {
            match known.get_mut(&listing.id) {
                Some(snapshot) => {
                    let previous_price = snapshot.price;
                    apply_observation(snapshot, listing, now);
                    if listing.price < previous_price {
                        changed.insert(listing.id.clone());
                    }
                }
                None => {
                    known.insert(
                        listing.id.clone(),
                        ListingSnapshot::first_observation(listing, now),
                    );
                    changed.insert(listing.id.clone());
                }
            }
            if observed.insert(listing.id.clone()) {
                observed_order.push(listing.id.clone());
            }
        }

        let mut reconciliation = Reconciliation::default();
        for id in observed_order {
            let Some(snapshot) = known.remove(&id) else {
                continue;
            };
            if changed.contains(&id) {
                reconciliation.changed.push(snapshot.clone());
            }
            reconciliation.to_persist.push(snapshot);
        }
        reconciliation
    }
}

/// Fields refreshed on every re-observation. `first_seen`, trim, year and href stay as stored.
fn apply_observation(snapshot: &mut ListingSnapshot, listing: &ScrapedListing, now: DateTime<Utc>) {
    snapshot.price = listing.price;
    snapshot.km_driven = listing.km_driven;
    snapshot.description = listing.description.clone();
    snapshot.region = listing.region.clone();
    snapshot.last_seen = now;
}
