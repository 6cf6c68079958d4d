//! HTTP/1.1 over circuit streams

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::traits::{BoxedStream, Circuit};
use crate::{Result, TorError};

/// Where a circuit stream goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Wrap the stream in TLS
    pub tls: bool,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// `http`/`ws` default to port 80, `https`/`wss` to 443 with TLS
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let host = uri
            .host()
            .ok_or_else(|| TorError::InvalidUri(uri.to_string()))?;
        let (port, tls) = match uri.scheme_str() {
            Some("http") | Some("ws") => (80, false),
            Some("https") | Some("wss") => (443, true),
            other => return Err(TorError::UnsupportedScheme(other.unwrap_or_default().to_string())),
        };
        Ok(Self::new(host, uri.port_u16().unwrap_or(port), tls))
    }
}

/// Open a stream through `circuit` to the host of `uri`
pub async fn open_as(circuit: &dyn Circuit, uri: &Uri) -> Result<BoxedStream> {
    let target = Target::from_uri(uri)?;
    circuit.open(&target).await
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// HTTP/1.1 client connection over one stream.
///
/// The connection driver task is aborted when the session is dropped.
pub struct HttpSession {
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
}

impl HttpSession {
    pub async fn handshake(stream: BoxedStream) -> Result<Self> {
        let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP connection ended: {}", e);
            }
        });
        Ok(Self { sender, driver })
    }

    pub async fn get(&mut self, uri: &Uri) -> Result<HttpResponse> {
        let request = request(Method::GET, uri)?.body(Full::new(Bytes::new()))?;
        self.send(request).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(&mut self, uri: &Uri, body: &B) -> Result<HttpResponse> {
        let body = serde_json::to_vec(body)?;
        let request = request(Method::POST, uri)?
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;
        self.send(request).await
    }

    async fn send(&mut self, request: Request<Full<Bytes>>) -> Result<HttpResponse> {
        self.sender.ready().await?;
        let response = self.sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok(HttpResponse { status, body })
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn request(method: Method, uri: &Uri) -> Result<http::request::Builder> {
    let authority = uri
        .authority()
        .ok_or_else(|| TorError::InvalidUri(uri.to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Ok(Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, authority.as_str()))
}
