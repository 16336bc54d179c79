//! Connection-level HTTP serving with a header-read deadline.
//!
//! `TimeoutLayer` only starts once a request has been parsed, so slow header
//! senders are cut off here, at the hyper connection.

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;

/// Accept connections until `shutdown` resolves. Connections already accepted
/// are left to finish on their own tasks.
pub async fn serve<F>(listener: TcpListener, app: Router, header_timeout: Duration, shutdown: F)
where
    F: Future<Output = ()> + Send,
{
    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout);

    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("[GMAIL_RELAY] Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let builder = builder.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                log::debug!("[GMAIL_RELAY] Connection from {} closed: {}", peer, e);
            }
        });
    }
}
