//! The two-phase transport contract the dispatcher and tracker rely on.
//!
//! Transports split request handling into a *fire* phase and a *collect*
//! phase: [`Transport::send`] issues a request and returns a correlation
//! handle immediately, and [`Transport::collect`] later reports what became
//! of that handle. This keeps the scheduler tick free of response latency —
//! the only wait a send may incur is bounded by the request timeout carried
//! on the [`OutboundRequest`].
//!
//! The core is agnostic to the concrete transport so long as it honors this
//! contract; [`HttpTransport`] is the batteries-included implementation
//! backed by `reqwest`.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::job::Method;

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `reqwest` crate.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The request target could not be constructed.
    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    /// The transport could not accept the request at all.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Correlation handle for one outstanding request.
///
/// Handles are opaque beyond equality: the tracker only ever stores them,
/// compares them, and passes them back to [`Transport::collect`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Generates a fresh handle.
    ///
    /// Transports call this when accepting a request; the core never mints
    /// handles itself.
    pub fn new() -> Self {
        Self(Ulid::new().into())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// A fully constructed outbound request, ready to fire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Request verb.
    pub method: Method,

    /// Absolute request target.
    pub url: reqwest::Url,

    /// Additional headers to apply.
    pub headers: Vec<(String, String)>,

    /// JSON body, if any.
    pub body: Option<serde_json::Value>,

    /// Bound on how long the request may stay outstanding.
    pub timeout: Duration,
}

/// What became of a previously sent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// No outcome yet; ask again on a later pass. Handles unknown to the
    /// transport also collect as pending.
    Pending,

    /// The request completed and a response arrived. The status code may
    /// still indicate failure; that judgment belongs to the caller.
    Delivered {
        /// HTTP status code of the response.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request was issued but never produced a response.
    Failed {
        /// Human-readable failure detail.
        message: String,
    },
}

/// An asynchronous fire-and-collect request transport.
pub trait Transport: Send + Sync + 'static {
    /// Issues the request, returning a handle for later collection.
    ///
    /// Must not block beyond issuing the request; the response is observed
    /// via [`collect`](Transport::collect). An error here means the request
    /// could not even be issued.
    fn send(&self, request: OutboundRequest) -> impl Future<Output = Result<HandleId>> + Send;

    /// Reports the current disposition of a previously returned handle.
    fn collect(&self, handle: HandleId) -> impl Future<Output = Result<Disposition>> + Send;
}

/// `reqwest`-backed [`Transport`].
///
/// `send` spawns the request onto the runtime and returns its handle
/// immediately; outcomes land in an in-process map that `collect` consults.
/// Outcomes live in the map until the process exits or the handle is
/// reconciled, whichever comes first — a restart therefore forgets
/// outstanding handles, which then collect as [`Disposition::Pending`]
/// forever and are subject to the stale-job reaper if one is configured.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
    outcomes: Arc<Mutex<HashMap<HandleId, Disposition>>>,
}

impl HttpTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport using the provided client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            outcomes: Arc::default(),
        }
    }

    fn record_outcome(outcomes: &Mutex<HashMap<HandleId, Disposition>>, handle: HandleId, disposition: Disposition) {
        outcomes
            .lock()
            .expect("Couldn't lock transport outcome map")
            .insert(handle, disposition);
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<HandleId> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        // Building can fail (e.g. unencodable header values); that's a
        // dispatch failure, not a transport outcome.
        let pending = builder.build()?;

        let handle = HandleId::new();
        Self::record_outcome(&self.outcomes, handle, Disposition::Pending);

        let client = self.client.clone();
        let outcomes = Arc::clone(&self.outcomes);
        tokio::spawn(async move {
            let disposition = match client.execute(pending).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.text().await {
                        Ok(body) => Disposition::Delivered { status, body },
                        Err(err) => Disposition::Failed {
                            message: err.to_string(),
                        },
                    }
                }
                Err(err) => Disposition::Failed {
                    message: err.to_string(),
                },
            };
            Self::record_outcome(&outcomes, handle, disposition);
        });

        Ok(handle)
    }

    async fn collect(&self, handle: HandleId) -> Result<Disposition> {
        let disposition = self
            .outcomes
            .lock()
            .expect("Couldn't lock transport outcome map")
            .get(&handle)
            .cloned()
            .unwrap_or(Disposition::Pending);

        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn collected(transport: &HttpTransport, handle: HandleId) -> Disposition {
        for _ in 0..200 {
            match transport.collect(handle).await.unwrap() {
                Disposition::Pending => tokio::time::sleep(Duration::from_millis(25)).await,
                disposition => return disposition,
            }
        }
        panic!("request never resolved");
    }

    fn request_to(url: &str) -> OutboundRequest {
        OutboundRequest {
            method: Method::Get,
            url: url.parse().unwrap(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test]
    async fn delivers_response_status_and_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = "pong";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });

        let transport = HttpTransport::new();
        let handle = transport
            .send(request_to(&format!("http://{addr}/ping")))
            .await
            .unwrap();

        assert_eq!(
            collected(&transport, handle).await,
            Disposition::Delivered {
                status: 200,
                body: "pong".to_string()
            }
        );
    }

    #[tokio::test]
    async fn connection_refused_collects_as_failed() {
        // Bind and drop to find a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new();
        let handle = transport
            .send(request_to(&format!("http://{addr}/unreachable")))
            .await
            .unwrap();

        assert!(matches!(
            collected(&transport, handle).await,
            Disposition::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_handles_collect_as_pending() {
        let transport = HttpTransport::new();
        let handle = HandleId::new();

        assert_eq!(
            transport.collect(handle).await.unwrap(),
            Disposition::Pending
        );
    }
}
