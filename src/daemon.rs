//! Periodically collect every configured project and persist the result as
//! a `file_sd` snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::collect;
use crate::pool::Pool;
use crate::projects::{ProjectLister, ProjectSet};
use crate::snapshot;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub output: PathBuf,
    pub frequency: Duration,
    pub projects: ProjectSet,
    pub excludes: Option<Regex>,
    pub auto_discovery: bool,
}

pub struct Daemon {
    config: DaemonConfig,
    pool: Pool,
    lister: Arc<dyn ProjectLister>,

    /// projects found by the last successful auto-discovery
    discovered: ProjectSet,
}

impl Daemon {
    pub fn new(config: DaemonConfig, pool: Pool, lister: Arc<dyn ProjectLister>) -> Self {
        Self {
            config,
            pool,
            lister,
            discovered: ProjectSet::default(),
        }
    }

    /// Refresh right away and then once every `frequency`, until `shutdown`
    /// is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.refresh(&shutdown).await;
        }

        info!(message = "daemon stopped");
    }

    /// The projects of this cycle.
    async fn live_projects(&mut self, shutdown: &CancellationToken) -> ProjectSet {
        if self.config.auto_discovery {
            let result = tokio::select! {
                biased;

                _ = shutdown.cancelled() => None,
                result = self.lister.projects() => Some(result),
            };

            match result {
                Some(Ok(projects)) => self.discovered = projects.into_iter().collect(),
                Some(Err(err)) => {
                    error!(
                        message = "projects auto discovery failed, keep previous projects",
                        %err
                    );
                }
                None => {}
            }
        }

        self.config
            .projects
            .union(&self.discovered)
            .exclude(self.config.excludes.as_ref())
    }

    /// One refresh cycle, returns true if the snapshot was replaced.
    pub async fn refresh(&mut self, shutdown: &CancellationToken) -> bool {
        let start = Instant::now();
        let projects = self.live_projects(shutdown).await;

        let collection = collect(&self.pool, &projects, shutdown).await;
        if !collection.complete {
            info!(message = "invalid targets collection, skipping");
            return false;
        }

        let output = self.config.output.clone();
        let targets = collection.targets;
        let groups = targets.len();
        let result =
            tokio::task::spawn_blocking(move || snapshot::write(&output, &targets)).await;

        match result {
            Ok(Ok(())) => {
                info!(
                    message = "targets updated",
                    path = ?self.config.output,
                    projects = projects.len(),
                    groups,
                    elapsed = ?start.elapsed(),
                );
                true
            }
            Ok(Err(err)) => {
                error!(
                    message = "write targets snapshot failed",
                    path = ?self.config.output,
                    %err
                );
                false
            }
            Err(err) => {
                error!(message = "snapshot writer panicked", %err);
                false
            }
        }
    }
}
