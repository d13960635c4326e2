use crate::runner::metrics::Metrics;

use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};

use std::net::SocketAddr;
use std::sync::Arc;

/// Serves `/health` and `/metrics` until the server fails. Returns immediately if neither is exposed.
pub(crate) async fn start(
    port: u16,
    metrics: Arc<Metrics>,
    serve_metrics: bool,
    serve_health: bool,
) {
    if !serve_metrics && !serve_health {
        log::info!("Not starting http server since both '/metrics' and '/health' are disabled");
        return;
    }
    let address: SocketAddr = ([0u8; 4], port).into();
    log::info!(
        "Starting server on address: {}, exposing '/metrics': {}, '/health': {}",
        address,
        serve_metrics,
        serve_health
    );

    let svc = Svc {
        metrics,
        serve_metrics,
        serve_health,
    };
    let service = make_service_fn(move |_| {
        let service = svc.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                futures_util::future::ready(service.handle_request(request))
            }))
        }
    });
    if let Err(err) = Server::bind(&address).serve(service).await {
        log::error!("Server failed with error: {:?}", err);
    }
}

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
struct Svc {
    metrics: Arc<Metrics>,
    serve_metrics: bool,
    serve_health: bool,
}

impl Svc {
    fn status(&self, status: u16) -> Result<Response<Body>, Error> {
        Ok(Response::builder().status(status).body(Body::empty())?)
    }

    fn metrics(&self) -> Result<Response<Body>, Error> {
        let body = self.metrics.encode_as_text()?;
        let resp = Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(Body::from(body))?;
        Ok(resp)
    }

    fn handle_request(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let req_path = request.uri().path().trim_end_matches('/');
        let req_method = request.method();
        log::debug!("Got http request {} {}", req_method, request.uri());

        let result = match (req_method, req_path) {
            (&Method::GET, "/health") if self.serve_health => self.status(200),
            (&Method::GET, "/metrics") if self.serve_metrics => self.metrics(),
            _ => self.status(404),
        };
        match result.as_ref() {
            Ok(resp) => log::debug!(
                "Finished handling {} {} with response status: {}",
                req_method,
                request.uri(),
                resp.status()
            ),
            Err(err) => log::error!(
                "Error handling {} {}, error: {:?}",
                req_method,
                request.uri(),
                err
            ),
        }
        result
    }
}
