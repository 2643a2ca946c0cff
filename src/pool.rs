//! A fixed number of discovery workers sharing one request channel.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::discovery::{self, Compute, discover};
use crate::targets::TargetGroup;

pub const DEFAULT_POOL_SIZE: usize = 20;

pub type Reply = Result<Vec<TargetGroup>, discovery::Error>;

/// Discover one project, the answer is delivered once on `reply`.
#[derive(Debug)]
pub struct DiscoveryRequest {
    pub project: String,
    pub filter: Option<String>,

    reply: oneshot::Sender<Reply>,
}

impl DiscoveryRequest {
    pub fn new(
        project: impl Into<String>,
        filter: Option<String>,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (reply, rx) = oneshot::channel();

        (
            Self {
                project: project.into(),
                filter,
                reply,
            },
            rx,
        )
    }
}

#[derive(Clone)]
pub struct Pool {
    tx: flume::Sender<DiscoveryRequest>,
}

impl Pool {
    /// Start `size` workers, every one of them stops taking requests once
    /// `shutdown` is cancelled. A call in flight runs to completion.
    pub fn spawn(
        compute: Arc<dyn Compute>,
        size: usize,
        region_lookup: bool,
        shutdown: CancellationToken,
    ) -> Self {
        // rendezvous, a request is only accepted by an idle worker
        let (tx, rx) = flume::bounded::<DiscoveryRequest>(0);

        for id in 0..size.max(1) {
            let rx = rx.clone();
            let compute = Arc::clone(&compute);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    let req = tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => break,
                        result = rx.recv_async() => match result {
                            Ok(req) => req,
                            Err(_) => break,
                        }
                    };

                    let DiscoveryRequest {
                        project,
                        filter,
                        reply,
                    } = req;
                    let result =
                        discover(compute.as_ref(), &project, filter.as_deref(), region_lookup)
                            .await;

                    if reply.send(result).is_err() {
                        debug!(
                            message = "discovery result dropped, requester is gone",
                            worker = id,
                            %project
                        );
                    }
                }

                trace!(message = "discovery worker stopped", worker = id);
            });
        }

        Pool { tx }
    }

    /// Hand a request to the next idle worker.
    pub async fn submit(&self, req: DiscoveryRequest) -> Result<(), discovery::Error> {
        self.tx
            .send_async(req)
            .await
            .map_err(|_| discovery::Error::PoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::testing::{FakeCompute, instance};

    #[tokio::test]
    async fn every_request_gets_one_reply() {
        let compute = FakeCompute::default().project(
            "p1",
            vec![vec![instance("a", "10.0.0.1", &[("prometheus_ports", "9100")])]],
        );
        let pool = Pool::spawn(Arc::new(compute), 2, false, CancellationToken::new());

        let (req, ok) = DiscoveryRequest::new("p1", None);
        pool.submit(req).await.unwrap();
        let groups = ok.await.unwrap().unwrap();
        assert_eq!(groups[0].targets, ["10.0.0.1:9100"]);

        let (req, missing) = DiscoveryRequest::new("p2", None);
        pool.submit(req).await.unwrap();
        assert!(matches!(
            missing.await.unwrap(),
            Err(discovery::Error::ListInstances { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_pool_refuses_requests() {
        let shutdown = CancellationToken::new();
        let pool = Pool::spawn(Arc::new(FakeCompute::default()), 3, false, shutdown.clone());

        shutdown.cancel();

        // workers drop their receivers on the way out
        let (req, _rx) = DiscoveryRequest::new("p1", None);
        let err = pool.submit(req).await.unwrap_err();
        assert!(matches!(err, discovery::Error::PoolClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn call_in_flight_survives_cancellation() {
        let gate = Arc::new(Notify::new());
        let compute = Arc::new(
            FakeCompute::default()
                .project(
                    "slow",
                    vec![vec![instance("a", "10.0.0.1", &[("prometheus_ports", "9100")])]],
                )
                .gated("slow", gate.clone()),
        );
        let shutdown = CancellationToken::new();
        let pool = Pool::spawn(compute.clone(), 1, false, shutdown.clone());

        let (req, rx) = DiscoveryRequest::new("slow", None);
        pool.submit(req).await.unwrap();
        while compute.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        shutdown.cancel();
        gate.notify_one();

        let groups = rx.await.unwrap().unwrap();
        assert_eq!(groups[0].targets, ["10.0.0.1:9100"]);

        // the worker is gone once its last call is answered
        let (req, _rx) = DiscoveryRequest::new("slow", None);
        assert!(matches!(
            pool.submit(req).await,
            Err(discovery::Error::PoolClosed)
        ));
    }
}
