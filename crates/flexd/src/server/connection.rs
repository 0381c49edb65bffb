//! Serving HTTP/1.1 on a single accepted connection.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`
//! - Connection errors are logged and end only that connection

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::{Dispatcher, Peer};

/// Serves requests from `io` until the peer hangs up or `cancel` fires.
///
/// On cancellation the in-flight request is allowed to finish before the
/// connection is closed.
pub(crate) async fn serve_connection<S>(
    io: S,
    peer: Peer,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| Arc::clone(&dispatcher).handle(request, peer));
    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(%peer, error = %e, "Connection ended with error");
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(%peer, error = %e, "Connection error during shutdown");
            }
        }
    }
    debug!(%peer, "Connection closed");
}
