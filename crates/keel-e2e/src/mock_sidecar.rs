//! Mock sidecar HTTP surface
//!
//! Stands in for the pod's invoke endpoint. Every request is recorded, and
//! responses are chosen by request path with a configurable fallback.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Request path and query
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First header value named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

type Canned = (StatusCode, Vec<u8>);

#[derive(Default)]
struct State {
    requests: RwLock<Vec<RecordedRequest>>,
    routes: RwLock<HashMap<String, Canned>>,
    fallback: RwLock<Option<Canned>>,
}

impl State {
    fn response_for(&self, path: &str) -> Canned {
        if let Some(canned) = self.routes.read().get(path) {
            return canned.clone();
        }
        self.fallback
            .read()
            .clone()
            .unwrap_or((StatusCode::OK, b"OK".to_vec()))
    }
}

/// A mock sidecar listening on an ephemeral local port
pub struct MockSidecar {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockSidecar {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock sidecar");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let server_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = server_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(&state, req).await) }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Answer requests for `path` with `status` and `body`
    pub fn respond(&self, path: &str, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.state
            .routes
            .write()
            .insert(path.to_string(), (status, body.into()));
    }

    /// Answer unmatched paths with `status` and `body`
    pub fn respond_default(&self, status: StatusCode, body: impl Into<Vec<u8>>) {
        *self.state.fallback.write() = Some((status, body.into()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.read().last().cloned()
    }
}

async fn handle(state: &State, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let path = req.uri().path().to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    state.requests.write().push(RecordedRequest {
        method,
        uri,
        headers,
        body,
    });

    let (status, body) = state.response_for(&path);
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_and_fallback() {
        let sidecar = MockSidecar::start().await;
        sidecar.respond("/v1/invoke/core/method/status", StatusCode::OK, "running");
        sidecar.respond_default(StatusCode::NOT_FOUND, "missing");

        let client = reqwest::Client::new();
        let hit = client
            .get(format!("http://{}/v1/invoke/core/method/status", sidecar.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(hit.status(), 200);
        assert_eq!(hit.text().await.unwrap(), "running");

        let miss = client
            .post(format!("http://{}/elsewhere", sidecar.addr()))
            .header("content-type", "application/json")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(miss.status(), 404);

        let requests = sidecar.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].method, "POST");
        assert_eq!(requests[1].header("Content-Type"), Some("application/json"));
        assert_eq!(requests[1].body, b"{}");
    }
}
