use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::pool::{DiscoveryRequest, Pool};
use crate::projects::ProjectSet;
use crate::targets::TargetGroup;

/// Merged target groups of one collection.
#[derive(Debug, Default)]
pub struct Collection {
    pub targets: Vec<TargetGroup>,

    /// False unless every project answered, the targets then hold only the
    /// projects that answered in time.
    pub complete: bool,
}

/// Discover every project of `projects` through `pool` and merge the results.
///
/// A failing project is logged and contributes nothing, only cancellation
/// stops the collection early. A request the pool dropped without an answer
/// leaves the collection incomplete.
pub async fn collect(pool: &Pool, projects: &ProjectSet, cancel: &CancellationToken) -> Collection {
    let mut collection = Collection {
        targets: vec![],
        complete: true,
    };
    if projects.is_empty() {
        return collection;
    }

    let mut requests = Vec::with_capacity(projects.len());
    let mut pending = FuturesUnordered::new();
    for project in projects.iter() {
        let (req, rx) = DiscoveryRequest::new(project.clone(), None);
        requests.push(req);

        let project = project.clone();
        pending.push(async move { (project, rx.await) });
    }

    // feed the pool from a separate task, a busy pool never blocks the wait
    let pool = pool.clone();
    let _feeder = AbortOnDropHandle::new(tokio::spawn(async move {
        for req in requests {
            let project = req.project.clone();
            if let Err(err) = pool.submit(req).await {
                warn!(message = "submit discovery request failed", %project, %err);
            }
        }
    }));

    let mut answered = 0;
    while !pending.is_empty() {
        tokio::select! {
            biased;

            Some((project, reply)) = pending.next() => match reply {
                Ok(Ok(groups)) => {
                    answered += 1;
                    collection.targets.extend(groups);
                }
                Ok(Err(err)) => {
                    answered += 1;
                    warn!(message = "discover project failed", %project, %err);
                }
                Err(_) => {
                    collection.complete = false;
                    warn!(message = "discovery request dropped without reply", %project);
                }
            },
            _ = cancel.cancelled() => {
                collection.complete = false;
                break;
            }
        }
    }

    collection.complete &= answered == projects.len();

    debug!(
        message = "collection finished",
        projects = projects.len(),
        answered,
        groups = collection.targets.len(),
        complete = collection.complete,
    );

    collection
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeCompute, instance};

    fn project(name: &str, ip: &str) -> Vec<Vec<gcp::compute::Instance>> {
        vec![vec![instance(name, ip, &[("prometheus_ports", "9100")])]]
    }

    fn targets(collection: &Collection) -> Vec<String> {
        let mut targets = collection
            .targets
            .iter()
            .flat_map(|group| group.targets.clone())
            .collect::<Vec<_>>();
        targets.sort();
        targets
    }

    #[tokio::test]
    async fn empty_project_set_is_complete() {
        let pool = Pool::spawn(
            Arc::new(FakeCompute::default()),
            1,
            false,
            CancellationToken::new(),
        );

        let collection = collect(&pool, &ProjectSet::default(), &CancellationToken::new()).await;
        assert!(collection.complete);
        assert!(collection.targets.is_empty());
    }

    #[tokio::test]
    async fn duplicated_projects_are_requested_once() {
        let compute = Arc::new(
            FakeCompute::default()
                .project("a", project("a", "10.0.0.1"))
                .project("b", project("b", "10.0.0.2")),
        );
        let pool = Pool::spawn(compute.clone(), 4, false, CancellationToken::new());

        let collection = collect(&pool, &ProjectSet::parse("a,a,b"), &CancellationToken::new()).await;

        assert!(collection.complete);
        assert_eq!(targets(&collection), ["10.0.0.1:9100", "10.0.0.2:9100"]);

        let mut calls = compute.calls();
        calls.sort();
        assert_eq!(calls, ["a", "b"]);
    }

    #[tokio::test]
    async fn failed_project_does_not_abort_siblings() {
        let compute = FakeCompute::default()
            .project("a", project("a", "10.0.0.1"))
            .project("c", project("c", "10.0.0.3"));
        // "b" is unknown to the fake and fails with 404
        let pool = Pool::spawn(Arc::new(compute), 2, false, CancellationToken::new());

        let collection = collect(&pool, &ProjectSet::parse("a,b,c"), &CancellationToken::new()).await;

        assert!(collection.complete);
        assert_eq!(targets(&collection), ["10.0.0.1:9100", "10.0.0.3:9100"]);
    }

    #[tokio::test]
    async fn closed_pool_is_incomplete() {
        let shutdown = CancellationToken::new();
        let pool = Pool::spawn(
            Arc::new(FakeCompute::default().project("a", project("a", "10.0.0.1"))),
            2,
            false,
            shutdown.clone(),
        );
        shutdown.cancel();

        let collection = collect(&pool, &ProjectSet::parse("a"), &CancellationToken::new()).await;
        assert!(!collection.complete);
        assert!(collection.targets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_partial_results() {
        let compute = Arc::new(
            FakeCompute::default()
                .project("a", project("a", "10.0.0.1"))
                .project("b", project("b", "10.0.0.2"))
                .project("c", project("c", "10.0.0.3"))
                .hanging("d")
                .hanging("e"),
        );
        let pool = Pool::spawn(compute.clone(), 5, false, CancellationToken::new());
        let cancel = CancellationToken::new();

        let collecting = tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move { collect(&pool, &ProjectSet::parse("a,b,c,d,e"), &cancel).await }
        });

        // every project reached a worker, three of them answered
        while compute.calls().len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let collection = collecting.await.unwrap();
        assert!(!collection.complete);
        assert_eq!(
            targets(&collection),
            ["10.0.0.1:9100", "10.0.0.2:9100", "10.0.0.3:9100"]
        );
    }
}
