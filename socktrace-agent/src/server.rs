//! Prometheus metrics endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serves the registry over HTTP until the shutdown flag flips.
pub async fn serve_metrics(
    addr: SocketAddr,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("metrics server listening on http://{addr}/metrics");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("metrics server stopping");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let registry = registry.clone();
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| request_handler(registry.clone(), req));
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("metrics connection error: {e:?}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn request_handler(
    registry: Arc<Registry>,
    _request: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut buf = String::new();
    match encode(&mut buf, &registry) {
        Ok(()) => Ok(Response::builder()
            .header(
                hyper::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Full::from(buf))
            .unwrap()),
        Err(_) => Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::from(Bytes::new()))
            .unwrap()),
    }
}
