use crate::Handler;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause after a failed `accept` so a persistent error (fd exhaustion) does
/// not turn the accept loop into a busy loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP/1.1 listener feeding connections to a [`Handler`].
pub struct Server {
    listener: TcpListener,
    request_timeout: Option<Duration>,
}

impl Server {
    /// Bind the listening socket. Failing here is fatal for the caller; no
    /// request has been accepted yet.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.or_raise(|| ErrorKind::Bind(addr))?;
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener, request_timeout: None }
    }

    /// Address actually bound (useful with port `0`).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.listener.local_addr().map_err(ErrorKind::from)?;
        Ok(addr)
    }

    /// Bound how long a client may take to deliver a request's headers.
    ///
    /// Applies to each request on a connection, including the wait for the
    /// next one on a kept-alive connection. `None` means no limit.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Accept and serve connections until `shutdown` is cancelled.
    ///
    /// On shutdown the listener is closed first, then every open connection
    /// is asked to finish its in-flight request and close; this returns once
    /// they all have.
    pub async fn serve(self, handler: Arc<Handler>, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "Listening");
        let connections = TaskTracker::new();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually transient (fd exhaustion, aborted handshake).
                    tracing::warn!(error = %e, "Failed to accept connection");
                    if !backoff(&shutdown).await {
                        break;
                    }
                    continue;
                },
            };
            connections.spawn(serve_connection(
                stream,
                peer,
                handler.clone(),
                self.request_timeout,
                shutdown.clone(),
            ));
        }
        drop(self.listener);
        connections.close();
        tracing::info!(open = connections.len(), "Stopped accepting connections; draining");
        connections.wait().await;
        tracing::info!("Server stopped");
        Ok(())
    }
}

/// Wait out [`ACCEPT_ERROR_BACKOFF`]. Returns `false` if shutdown was
/// requested in the meantime.
async fn backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    request_timeout: Option<Duration>,
    shutdown: CancellationToken,
) {
    let service = service_fn(move |request: hyper::Request<Incoming>| {
        let handler = handler.clone();
        async move {
            let (parts, _body) = request.into_parts();
            Ok::<_, Infallible>(handler.handle(&parts, peer))
        }
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(request_timeout);
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        },
    };
    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "Connection closed with error");
    }
}
