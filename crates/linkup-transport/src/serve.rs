//! Hosting for the HTTP-based listeners (`ws`, `wss`, `http`, `https`).

use axum::Router;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::channel::ListenerTask;
use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::tls::TlsListener;

/// Bind `endpoint` and serve `router` on it until `cancel` fires.
pub(crate) async fn spawn_router(
    endpoint: &Endpoint,
    tls: Option<TlsAcceptor>,
    router: Router,
    cancel: CancellationToken,
) -> Result<ListenerTask> {
    let listener = TcpListener::bind(endpoint.authority()).await?;
    let addr = listener.local_addr()?;
    let label = endpoint.to_string();
    let shutdown = cancel.clone().cancelled_owned();

    let handle = match tls {
        None => tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(endpoint = %label, error = %e, "http listener failed");
            }
        }),
        Some(acceptor) => tokio::spawn(async move {
            if let Err(e) = axum::serve(TlsListener::new(listener, acceptor), router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(endpoint = %label, error = %e, "https listener failed");
            }
        }),
    };

    info!(%endpoint, %addr, "http listener started");
    Ok(ListenerTask {
        cancel,
        handle,
        addr,
    })
}
