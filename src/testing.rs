//! Shared test support: entry fixtures and an in-process HTTP stub.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, body::Incoming};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;

use crate::config::Rules;
use crate::entry::{LogEntry, Replay, Verb};

/// Build a classified entry for the given request shape.
pub(crate) fn entry(client_ip: &str, verb: Verb, request: &str, response: u16) -> LogEntry {
    let mut entry = LogEntry {
        client_ip: client_ip.to_string(),
        ident: String::new(),
        auth: String::new(),
        host: String::new(),
        loadbalancer: String::new(),
        verb,
        request: request.to_string(),
        path: String::new(),
        http_version: "HTTP/1.1".to_string(),
        response,
        bytes: String::new(),
        referrer: String::new(),
        agent: String::new(),
        content_type: crate::entry::ContentType::Page,
        timestamp: Utc::now(),
        replay: Replay::default(),
    };
    Rules::default().apply(&mut entry);
    entry
}

/// One request as observed by a [`StubServer`].
#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: String,
}

/// A minimal in-process HTTP server that records every request it sees and
/// answers each with a fixed status and empty body.
#[derive(Debug)]
pub(crate) struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl StubServer {
    /// Bind an ephemeral port and start serving.
    pub(crate) async fn spawn(status: StatusCode) -> Self {
        Self::spawn_with_delay(status, std::time::Duration::ZERO).await
    }

    /// Like [`StubServer::spawn`] but each response is delayed, for tests
    /// that need the target to be slow.
    pub(crate) async fn spawn_with_delay(
        status: StatusCode,
        delay: std::time::Duration,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("stub listener should bind");
        let addr = listener
            .local_addr()
            .expect("stub listener should have an address");
        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::default();

        let captured = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let captured = Arc::clone(&captured);
                        async move {
                            let (parts, body) = request.into_parts();
                            let body = body.collect().await?.to_bytes();
                            captured
                                .lock()
                                .expect("stub capture lock poisoned")
                                .push(CapturedRequest {
                                    method: parts.method.to_string(),
                                    uri: parts.uri.to_string(),
                                    headers: parts.headers,
                                    body: String::from_utf8_lossy(&body).into_owned(),
                                });
                            tokio::time::sleep(delay).await;

                            let mut response = Response::new(crate::full(Vec::new()));
                            *response.status_mut() = status;
                            Ok::<_, hyper::Error>(response)
                        }
                    });
                    let _ = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests }
    }

    /// Base URL of the stub, without a trailing slash.
    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Snapshot of every request captured so far.
    pub(crate) fn requests(&self) -> Vec<CapturedRequest> {
        self.requests
            .lock()
            .expect("stub capture lock poisoned")
            .clone()
    }
}
