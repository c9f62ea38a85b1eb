use std::sync::Arc;

use carwatch_adapters::{ListingSource, SourceError};
use carwatch_core::{NotificationRule, TriggeredNotification, WatchDefinition};
use carwatch_storage::{BatchPersister, EntityStore, PersistError, StoreError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::diff::DiffEngine;
use crate::evaluate::NotificationEvaluator;
use crate::notify::{group_by_destination, NotificationBatch, Notifier, NotifyError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
    #[error("listing search for {model} failed: {source}")]
    Source {
        model: String,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("{failed} of {attempted} notification dispatches failed; first: {first}")]
    Notify {
        failed: usize,
        attempted: usize,
        #[source]
        first: NotifyError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watches: usize,
    pub live_listings: usize,
    pub persisted_snapshots: usize,
    pub changed_listings: usize,
    pub notifications: usize,
    pub destinations: usize,
}

#[derive(Debug, Default)]
struct WatchOutcome {
    live_listings: usize,
    persisted_snapshots: usize,
    changed_listings: usize,
    triggered: Vec<TriggeredNotification>,
}

/// Drives one fetch, reconcile, persist and evaluate cycle per watch, then dispatches the
/// accumulated notifications once. Any failure before dispatch aborts the run.
pub struct Orchestrator {
    store: Arc<dyn EntityStore>,
    source: Arc<dyn ListingSource>,
    notifier: Arc<dyn Notifier>,
    diff: DiffEngine,
    evaluator: NotificationEvaluator,
    persister: BatchPersister,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        source: Arc<dyn ListingSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            diff: DiffEngine,
            evaluator: NotificationEvaluator,
            persister: BatchPersister::default(),
        }
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = self.source.source_id());
        let result = self.run_inner(run_id).instrument(span.clone()).await;
        if let Err(err) = &result {
            span.in_scope(|| error!(error = %err, "run aborted"));
        }
        result
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let catalog = self.store.load_catalog().await?;
        self.evaluator.lint_rules(&catalog.rules);
        info!(
            watches = catalog.watches.len(),
            rules = catalog.rules.len(),
            "catalog loaded"
        );

        let mut live_listings = 0usize;
        let mut persisted_snapshots = 0usize;
        let mut changed_listings = 0usize;
        let mut triggered = Vec::new();

        for watch in &catalog.watches {
            let rules = catalog.rules_for_model(&watch.model);
            let span = info_span!("watch", model = %watch.model, trim = %watch.trim);
            let outcome = self.process_watch(watch, &rules).instrument(span).await?;
            live_listings += outcome.live_listings;
            persisted_snapshots += outcome.persisted_snapshots;
            changed_listings += outcome.changed_listings;
            triggered.extend(outcome.triggered);
        }

        let notifications = triggered.len();
        let batches = group_by_destination(triggered);
        self.dispatch(&batches).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            watches: catalog.watches.len(),
            live_listings,
            persisted_snapshots,
            changed_listings,
            notifications,
            destinations: batches.len(),
        };
        info!(
            live_listings,
            persisted_snapshots,
            changed_listings,
            notifications,
            destinations = summary.destinations,
            "run complete"
        );
        Ok(summary)
    }

    async fn process_watch(
        &self,
        watch: &WatchDefinition,
        rules: &[NotificationRule],
    ) -> Result<WatchOutcome, RunError> {
        let stored = async {
            self.store
                .read_partition(watch.partition_key())
                .await
                .map_err(RunError::from)
        };
        let live = async {
            self.source
                .search(watch)
                .await
                .map_err(|source| RunError::Source {
                    model: watch.model.clone(),
                    source,
                })
        };
        let (stored, mut live) = tokio::try_join!(stored, live)?;

        // Sources may report the model in any casing; the watch owns the partition key.
        for listing in &mut live {
            if listing.model != watch.model {
                listing.model = watch.model.clone();
            }
        }

        let stored_count = stored.len();
        let reconciliation = self.diff.reconcile(stored, &live);
        let changed = reconciliation.changed;
        let report = self
            .persister
            .persist(reconciliation.to_persist, self.store.as_ref())
            .await?;

        let triggered: Vec<TriggeredNotification> = changed
            .iter()
            .flat_map(|listing| self.evaluator.evaluate(listing, rules))
            .collect();

        info!(
            stored = stored_count,
            live = live.len(),
            persisted = report.entities,
            partitions = report.partitions,
            chunks = report.chunks,
            changed = changed.len(),
            triggered = triggered.len(),
            "watch reconciled"
        );

        Ok(WatchOutcome {
            live_listings: live.len(),
            persisted_snapshots: report.entities,
            changed_listings: changed.len(),
            triggered,
        })
    }

    /// Sends every batch concurrently and waits for all of them before reporting failures.
    async fn dispatch(&self, batches: &[NotificationBatch]) -> Result<(), RunError> {
        if batches.is_empty() {
            return Ok(());
        }

        let results = join_all(
            batches
                .iter()
                .map(|batch| self.notifier.send(&batch.destination, &batch.listings)),
        )
        .await;

        let attempted = results.len();
        let mut failures = results.into_iter().filter_map(Result::err).collect::<Vec<_>>();
        for failure in &failures {
            warn!(error = %failure, "notification dispatch failed");
        }
        if failures.is_empty() {
            return Ok(());
        }
        let failed = failures.len();
        Err(RunError::Notify {
            failed,
            attempted,
            first: failures.remove(0),
        })
    }
}
