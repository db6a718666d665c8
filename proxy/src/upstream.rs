//! A minimal forwarding client for upstream requests that dials the
//! destination itself (rather than delegating to a pooling HTTP client)
//! so it can set `SO_MARK` on the egress socket before the redirect rule
//! ever sees the packet, and can re-encrypt plaintext-decrypted MITM
//! traffic bound for an HTTPS origin.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::Request;
use hyper::Response;
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::Connected;
use hyper_util::client::legacy::connect::Connection;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::ProxyError;
use crate::original_dst;

/// Either a plaintext TCP connection or a TLS connection to the origin,
/// unified behind one `AsyncRead + AsyncWrite` so hyper's client can treat
/// them identically.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for TokioIo<MaybeTlsStream> {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

#[derive(Clone)]
pub struct MarkedConnector {
    tls_config: Arc<rustls::ClientConfig>,
}

impl MarkedConnector {
    pub fn new(tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self { tls_config }
    }
}

impl tower_service::Service<Uri> for MarkedConnector {
    type Response = TokioIo<MaybeTlsStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_config = self.tls_config.clone();
        Box::pin(async move {
            let host = uri.host().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing host in upstream uri"))?.to_string();
            let is_tls = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            original_dst::set_egress_mark(&tcp)?;

            if is_tls {
                let server_name = rustls::pki_types::ServerName::try_from(host)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let connector = TlsConnector::from(tls_config);
                let tls = connector.connect(server_name, tcp).await?;
                Ok(TokioIo::new(MaybeTlsStream::Tls(Box::new(tls))))
            } else {
                Ok(TokioIo::new(MaybeTlsStream::Plain(tcp)))
            }
        })
    }
}

pub type UpstreamClient = Client<MarkedConnector, Full<Bytes>>;

pub fn build_client() -> UpstreamClient {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
    let connector = MarkedConnector::new(Arc::new(tls_config));
    Client::builder(TokioExecutor::new()).build(connector)
}

pub async fn forward(client: &UpstreamClient, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, ProxyError> {
    let response = client.request(request).await.map_err(|e| ProxyError::Tls(e.to_string()))?;
    let (parts, body) = response.into_parts();
    let collected = body.collect().await.map_err(|e| ProxyError::Tls(e.to_string()))?.to_bytes();
    Ok(Response::from_parts(parts, collected))
}
