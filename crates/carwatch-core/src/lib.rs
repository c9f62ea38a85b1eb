//! Core domain model for carwatch: watches, rules, scraped listings and persisted snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "carwatch-core";

/// Trim value meaning "any trim" on both watches and rules.
pub const WILDCARD_TRIM: &str = "Any";

/// Case-insensitive equality by per-character Unicode lowercasing (`char::to_lowercase`).
/// Does not depend on the process locale. Not full case folding: "ß" and "SS" differ.
pub fn fold_eq(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

pub fn is_wildcard_trim(trim: &str) -> bool {
    fold_eq(trim.trim(), WILDCARD_TRIM)
}

/// A saved search tracked across runs. `model` doubles as the snapshot partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDefinition {
    pub model: String,
    #[serde(default = "wildcard_trim")]
    pub trim: String,
    #[serde(default)]
    pub earliest_year: Option<i32>,
    #[serde(default)]
    pub max_km_driven: Option<i64>,
}

impl WatchDefinition {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            trim: WILDCARD_TRIM.to_string(),
            earliest_year: None,
            max_km_driven: None,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.model
    }

    /// Free-text query: the model, with the trim appended unless it is the wildcard.
    pub fn search_phrase(&self) -> String {
        let trim = self.trim.trim();
        if trim.is_empty() || is_wildcard_trim(trim) {
            self.model.clone()
        } else {
            format!("{} {}", self.model, trim)
        }
    }
}

/// Notification predicate bound to a model. Year and mileage bounds are kept as entered;
/// blank or non-numeric values behave as unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub model: String,
    #[serde(default = "wildcard_trim")]
    pub trim: String,
    #[serde(default)]
    pub price_threshold: Option<i64>,
    #[serde(default)]
    pub earliest_year: Option<String>,
    #[serde(default)]
    pub max_km_driven: Option<String>,
    pub email: String,
}

impl NotificationRule {
    pub fn applies_to_model(&self, model: &str) -> bool {
        fold_eq(&self.model, model)
    }
}

fn wildcard_trim() -> String {
    WILDCARD_TRIM.to_string()
}

/// Everything the orchestrator loads up front in a single bulk read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCatalog {
    #[serde(default)]
    pub watches: Vec<WatchDefinition>,
    #[serde(default)]
    pub rules: Vec<NotificationRule>,
}

impl WatchCatalog {
    pub fn rules_for_model(&self, model: &str) -> Vec<NotificationRule> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to_model(model))
            .cloned()
            .collect()
    }
}

/// One observed item as returned by a listing source. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub id: String,
    pub model: String,
    pub trim: String,
    pub href: String,
    pub km_driven: i64,
    pub year: i32,
    pub price: i64,
    pub description: Option<String>,
    pub region: Option<String>,
}

/// Persisted last-known state of a listing, keyed by `(partition_key, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub partition_key: String,
    pub id: String,
    pub trim: String,
    pub price: i64,
    pub km_driven: i64,
    pub year: i32,
    pub description: Option<String>,
    pub region: Option<String>,
    pub href: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ListingSnapshot {
    /// Builds the snapshot for a first observation. Every field is mapped by hand so that a
    /// shape change on either side fails to compile instead of dropping data.
    pub fn first_observation(listing: &ScrapedListing, seen_at: DateTime<Utc>) -> Self {
        let ScrapedListing {
            id,
            model,
            trim,
            href,
            km_driven,
            year,
            price,
            description,
            region,
        } = listing;

        Self {
            partition_key: model.clone(),
            id: id.clone(),
            trim: trim.clone(),
            price: *price,
            km_driven: *km_driven,
            year: *year,
            description: description.clone(),
            region: region.clone(),
            href: href.clone(),
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    pub fn model(&self) -> &str {
        &self.partition_key
    }
}

/// A changed listing paired with the destination of a rule it satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredNotification {
    pub listing: ListingSnapshot,
    pub email: String,
}
