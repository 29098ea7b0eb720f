//! The update supervisor: periodic schema refresh and atomic snapshot swap.
//!
//! Services are polled under a fleet-wide concurrency cap. A service whose
//! update fails is logged and counted but keeps its last-known schema, so a
//! flapping downstream never takes working fields away. The merged snapshot
//! is replaced only under the writer lock, and only when something changed.

use std::sync::Arc;

use bramble_federation::auth::filter_schema;
use bramble_federation::merge::merge_schemas;
use bramble_federation::merge::ServiceSchema;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Configuration;
use crate::gateway::Gateway;
use crate::gateway::Snapshot;
use crate::poller::update_service;
use crate::poller::Service;

/// Fleet-wide cap on in-flight schema polls.
const MAX_CONCURRENT_POLLS: usize = 64;

impl Gateway {
    /// Polls every service and rebuilds the merged schema when any schema
    /// changed, or unconditionally when `force` is set.
    pub async fn update_schemas(&self, force: bool) {
        let semaphore = Semaphore::new(MAX_CONCURRENT_POLLS);
        let mut services = self.services.lock().await;

        let outcomes = join_all(services.iter_mut().map(|service| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("the poll semaphore is never closed");
                let url = service.url.clone();
                let result = update_service(
                    &self.poll_client,
                    service,
                    &self.config.id_field_name,
                    self.config.max_service_response_size,
                )
                .await;
                (url, result)
            }
        }))
        .await;

        let mut changed = false;
        let mut failures = 0usize;
        for (url, outcome) in outcomes {
            match outcome {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(err) => {
                    failures += 1;
                    warn!(service = %url, error = %err, "service update failed");
                }
            }
        }
        info!(
            services = services.len(),
            failures, changed, "service poll cycle finished"
        );

        if !changed && !force {
            return;
        }
        self.rebuild_snapshot(&services).await;
    }

    /// Merges the last-known schemas and swaps the snapshot in. A merge
    /// failure keeps the previous snapshot.
    async fn rebuild_snapshot(&self, services: &[Service]) {
        let schemas: Vec<ServiceSchema> = services
            .iter()
            .filter_map(|service| {
                let schema = service.schema.clone()?;
                Some(ServiceSchema {
                    name: if service.name.is_empty() {
                        service.url.clone()
                    } else {
                        service.name.clone()
                    },
                    version: service.version.clone(),
                    url: service.url.clone(),
                    schema,
                })
            })
            .collect();
        if schemas.is_empty() {
            warn!("no service schemas available; keeping previous snapshot");
            return;
        }

        match merge_schemas(&schemas, &self.config.id_field_name) {
            Ok(merged) => {
                let introspection_schema = match &self.config.permissions {
                    Some(permissions) => filter_schema(&merged.schema, permissions),
                    None => merged.schema.clone(),
                };
                let snapshot = Arc::new(Snapshot {
                    merged,
                    introspection_schema,
                });
                *self.snapshot.write().await = Some(snapshot);
                info!(services = schemas.len(), "merged schema updated");
            }
            Err(err) => {
                error!(error = %err, "schema merge failed; keeping previous snapshot");
            }
        }
    }

    /// Re-seeds the service list from a reloaded configuration. Known
    /// services keep their state; removed ones are dropped.
    pub async fn apply_services(&self, urls: &[String]) {
        let mut services = self.services.lock().await;
        services.retain(|service| urls.contains(&service.url));
        for url in urls {
            if !services.iter().any(|service| &service.url == url) {
                services.push(Service::new(url.clone()));
            }
        }
    }

    /// The supervision loop: refresh on every poll tick and on every
    /// configuration reload, until the gateway shuts down.
    pub async fn run(self: Arc<Self>, mut reloads: mpsc::Receiver<Configuration>) {
        self.update_schemas(true).await;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update_schemas(false).await;
                }
                reload = reloads.recv() => {
                    match reload {
                        Some(config) => {
                            self.apply_services(&config.services).await;
                            self.update_schemas(true).await;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}
