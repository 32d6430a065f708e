use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server,
};
use prometheus::{Encoder, TextEncoder};

/// Handle an HTTP request
async fn handle_request(request: Request<Body>) -> Result<Response<Body>, Infallible> {
    // The scrape endpoint is the only thing served here
    if request.method() == Method::GET && request.uri().path() == "/metrics" {
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .unwrap();
        return Ok(Response::new(Body::from(buffer)));
    }

    Ok(Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap())
}

/// Bring up an HTTP server that listens for metrics requests
pub async fn serve_metrics(bind_addr: SocketAddr) {
    let make_service =
        make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle_request)) });
    let server = Server::bind(&bind_addr).serve(make_service);

    if let Err(error) = server.await {
        log::error!("Metrics server error: {}", error);
    }
}
