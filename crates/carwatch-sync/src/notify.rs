use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use carwatch_core::{ListingSnapshot, TriggeredNotification};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("building notifier client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("delivery to {destination} failed: {source}")]
    Request {
        destination: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("delivery to {destination} rejected with status {status}")]
    Rejected { destination: String, status: u16 },
    #[error("notifier unavailable for {destination}")]
    Unavailable { destination: String },
}

/// Every listing triggered for one destination in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub destination: String,
    pub listings: Vec<ListingSnapshot>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, destination: &str, listings: &[ListingSnapshot]) -> Result<(), NotifyError>;
}

/// Groups by destination email in sorted order. A listing fired by several rules for the
/// same destination is delivered to it once.
pub fn group_by_destination(triggered: Vec<TriggeredNotification>) -> Vec<NotificationBatch> {
    let mut grouped: BTreeMap<String, (HashSet<(String, String)>, Vec<ListingSnapshot>)> =
        BTreeMap::new();
    for TriggeredNotification { listing, email } in triggered {
        let (seen, listings) = grouped.entry(email).or_default();
        if seen.insert((listing.partition_key.clone(), listing.id.clone())) {
            listings.push(listing);
        }
    }

    grouped
        .into_iter()
        .map(|(destination, (_, listings))| NotificationBatch {
            destination,
            listings,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, destination: &str, listings: &[ListingSnapshot]) -> Result<(), NotifyError> {
        info!(destination, count = listings.len(), "notifications triggered");
        for listing in listings {
            info!(
                destination,
                model = %listing.model(),
                id = %listing.id,
                trim = %listing.trim,
                price = listing.price,
                year = listing.year,
                km_driven = listing.km_driven,
                href = %listing.href,
                "listing"
            );
        }
        Ok(())
    }
}

/// POSTs each batch as JSON to a fixed endpoint that owns actual delivery.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, destination: &str, listings: &[ListingSnapshot]) -> Result<(), NotifyError> {
        let batch = NotificationBatch {
            destination: destination.to_string(),
            listings: listings.to_vec(),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&batch)
            .send()
            .await
            .map_err(|source| NotifyError::Request {
                destination: destination.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                destination: destination.to_string(),
                status: status.as_u16(),
            });
        }
        info!(destination, count = listings.len(), "notification batch delivered");
        Ok(())
    }
}

/// Keeps delivered batches in memory; destinations can be marked as failing.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<NotificationBatch>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_for(&self, destination: impl Into<String>) {
        self.failing.lock().await.insert(destination.into());
    }

    pub async fn delivered(&self) -> Vec<NotificationBatch> {
        let mut batches = self.delivered.lock().await.clone();
        batches.sort_by(|a, b| a.destination.cmp(&b.destination));
        batches
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, destination: &str, listings: &[ListingSnapshot]) -> Result<(), NotifyError> {
        if self.failing.lock().await.contains(destination) {
            return Err(NotifyError::Unavailable {
                destination: destination.to_string(),
            });
        }
        self.delivered.lock().await.push(NotificationBatch {
            destination: destination.to_string(),
            listings: listings.to_vec(),
        });
        Ok(())
    }
}
