// SPDX-License-Identifier: Apache-2.0

//! HTTP scrape endpoint.
//!
//! Serves the registry exposition on `GET /metrics`. Each scrape runs one
//! TTL sweep first, so idle children age out exactly at scrape boundaries
//! and the rendered snapshot is point-in-time per child.

use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use http::Method;
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::error;

use crate::metrics::Registry;

/// Content type of the Prometheus text exposition format.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const INDEX_PAGE: &str = "<html><head><title>tailscrape</title></head>\
<body><h1>tailscrape</h1><p><a href=\"/metrics\">Metrics</a></p></body></html>";

/// HTTP server exposing the metric registry.
pub struct MetricsServer {
    registry: Arc<Registry>,
}

impl MetricsServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Serve requests until cancelled, then drain open connections.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancellation: CancellationToken,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let svc = ExpositionService {
            registry: self.registry.clone(),
        };
        let svc = TowerToHyperService::new(svc);

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);

        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            let io = TokioIo::new(stream);

            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                let _ = fut.await.map_err(|e| {
                    error!("error serving scrape connection: {:?}", e);
                });
            });
        }

        graceful.shutdown().await;

        Ok(())
    }
}

#[derive(Clone)]
struct ExpositionService {
    registry: Arc<Registry>,
}

impl<H> Service<Request<H>> for ExpositionService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync + Clone,
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        let response = match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => {
                self.registry.sweep(Instant::now());
                let body = self.registry.render();
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", EXPOSITION_CONTENT_TYPE)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap()
            }
            (&Method::GET, "/") => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/html; charset=utf-8")
                .body(Full::new(Bytes::from_static(INDEX_PAGE.as_bytes())))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"Not Found")))
                .unwrap(),
        };
        Box::pin(futures::future::ok(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use http_body_util::BodyExt;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioTimer;
    use tokio::time::timeout;

    use crate::metrics::{labels, MetricKind};

    fn test_client() -> Client<HttpConnector, Full<Bytes>> {
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(2)
            .timer(TokioTimer::new())
            .build::<_, Full<Bytes>>(HttpConnector::new())
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_the_exposition() {
        let registry = Arc::new(Registry::new("test", Duration::from_secs(300)));
        registry
            .register("bytes", "help", MetricKind::Counter, None, false)
            .unwrap();
        registry
            .add("bytes", &labels([("host", "h1")]), 512.0)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let server = MetricsServer::new(registry);
        let cancellation = CancellationToken::new();
        let cancel_handle = cancellation.clone();

        let server_handle = tokio::spawn(async move { server.serve(listener, cancellation).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = test_client();
        let uri = format!("http://{}/metrics", bound_addr);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("request timed out")
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("Content-Type")
                .and_then(|v| v.to_str().ok()),
            Some(EXPOSITION_CONTENT_TYPE)
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE test_bytes counter"));
        assert!(text.contains("test_bytes{host=\"h1\"} 512"));
        assert!(text.contains("# TYPE test_connected gauge"));

        // Unknown routes 404; the index page is served at /.
        let uri = format!("http://{}/other", bound_addr);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("request timed out")
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let uri = format!("http://{}/", bound_addr);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("request timed out")
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::OK);

        cancel_handle.cancel();
        timeout(Duration::from_secs(5), server_handle)
            .await
            .expect("server shutdown timed out")
            .expect("server task failed")
            .expect("server returned error");
    }

    #[tokio::test]
    async fn scrape_triggers_a_ttl_sweep() {
        let registry = Arc::new(Registry::new("test", Duration::from_secs(0)));
        registry
            .register("bytes", "help", MetricKind::Counter, None, false)
            .unwrap();
        registry
            .add("bytes", &labels([("host", "h1")]), 1.0)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let server = MetricsServer::new(registry);
        let cancellation = CancellationToken::new();
        let cancel_handle = cancellation.clone();
        let server_handle = tokio::spawn(async move { server.serve(listener, cancellation).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        // With a zero TTL, the child written above is already stale by the
        // time the scrape sweeps.
        let client = test_client();
        let uri = format!("http://{}/metrics", bound_addr);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("request timed out")
            .expect("request failed");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("test_bytes{host=\"h1\"}"), "stale child must be swept:\n{text}");

        cancel_handle.cancel();
        timeout(Duration::from_secs(5), server_handle)
            .await
            .expect("server shutdown timed out")
            .expect("server task failed")
            .expect("server returned error");
    }
}
