use std::net::SocketAddr;

use futures::future::BoxFuture;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1::Builder;
use hyper::service::Service;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Serve the service with the supplied listener.
pub fn serve<S>(listener: TcpListener, service: S) -> Serve<S> {
    Serve { listener, service }
}

pub struct Serve<S> {
    listener: TcpListener,
    service: S,
}

impl<S> Serve<S> {
    /// Stop accepting once `shutdown` is cancelled, the returned future
    /// resolves after every open connection finished its in flight requests.
    pub fn with_graceful_shutdown(self, shutdown: CancellationToken) -> WithGracefulShutdown<S> {
        WithGracefulShutdown {
            listener: self.listener,
            service: self.service,
            shutdown,
        }
    }
}

/// Serve future with graceful shutdown enabled.
pub struct WithGracefulShutdown<S> {
    listener: TcpListener,
    shutdown: CancellationToken,
    service: S,
}

impl<S, B> IntoFuture for WithGracefulShutdown<S>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<crate::Error>,
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<crate::Error>,
{
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        let WithGracefulShutdown {
            listener,
            service,
            shutdown,
        } = self;

        Box::pin(async move {
            let connections = TaskTracker::new();

            loop {
                let (stream, peer) = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!(
                                message = "accept new connection failed",
                                %err
                            );

                            continue;
                        }
                    }
                };

                let shutdown = shutdown.clone();
                let service = ConnectInfo {
                    peer,
                    inner: service.clone(),
                };
                connections.spawn(async move {
                    let conn = Builder::new().serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);

                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        _ = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };

                    if let Err(err) = result {
                        trace!(
                            message = "failed to serve http connection",
                            %peer,
                            %err
                        );
                    }
                });
            }

            drop(listener);
            connections.close();
            debug!(
                message = "waiting for open connections",
                connections = connections.len()
            );
            connections.wait().await;
        })
    }
}

/// Inserts the peer address into the request extensions.
#[derive(Clone)]
struct ConnectInfo<S> {
    peer: SocketAddr,
    inner: S,
}

impl<B, S> Service<Request<B>> for ConnectInfo<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.peer);
        self.inner.call(req)
    }
}
