//! Per-connection request handling: classifies HTTP vs TLS, enforces the
//! connect + MCP policy, applies header rewrites and secrets substitution,
//! runs the MCP observer, and forwards to the real origin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper::header::CONTENT_ENCODING;
use hyper::header::CONTENT_LENGTH;
use hyper::header::CONTENT_TYPE;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use leash_ca::CertificateAuthority;
use leash_lsm::KernelBackend;
use leash_lsm::LSMManager;
use leash_logger::SharedLogger;
use leash_policy::ir::HeaderRewriteRule;
use leash_policy::ir::RuleEffect;
use leash_secrets::SecretsManager;

use crate::cert_resolver::HostCertResolver;
use crate::error::ProxyError;
use crate::mcp_observer;
use crate::mcp_observer::McpEventKind;
use crate::original_dst;
use crate::secrets_apply;
use crate::upstream::UpstreamClient;

const HTTP_METHOD_PREFIXES: &[&str] =
    &["GET ", "POST ", "PUT ", "HEAD ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE "];

pub struct ProxyState<B: KernelBackend> {
    pub ca: Arc<CertificateAuthority>,
    pub lsm: Arc<LSMManager<B>>,
    pub secrets: Arc<SecretsManager>,
    pub logger: SharedLogger,
    pub header_rewrites: Arc<RwLock<Vec<HeaderRewriteRule>>>,
    pub upstream: UpstreamClient,
    pub sniff_limit: usize,
}

pub async fn handle_connection<B: KernelBackend + 'static>(
    stream: TcpStream,
    _peer_addr: SocketAddr,
    state: Arc<ProxyState<B>>,
) -> Result<(), ProxyError> {
    let original_dst = original_dst::recover_original_dst(&stream)?;
    let ip4 = match original_dst.ip() {
        std::net::IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        std::net::IpAddr::V6(_) => 0,
    };
    let port = original_dst.port();

    let mut peek_buf = [0u8; 16];
    let n = stream.peek(&mut peek_buf).await?;
    let is_http = HTTP_METHOD_PREFIXES.iter().any(|p| peek_buf[..n].starts_with(p.as_bytes()));

    if is_http {
        serve_requests(stream, original_dst.ip().to_string(), ip4, port, "http", state).await
    } else {
        handle_tls(stream, original_dst, ip4, port, state).await
    }
}

async fn handle_tls<B: KernelBackend + 'static>(
    stream: TcpStream,
    original_dst: SocketAddr,
    ip4: u32,
    port: u16,
    state: Arc<ProxyState<B>>,
) -> Result<(), ProxyError> {
    let resolver = Arc::new(HostCertResolver::new(state.ca.clone(), original_dst.ip().to_string()));
    let mut server_config = rustls::ServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver);
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let tls_stream = acceptor.accept(stream).await.map_err(|e| ProxyError::Tls(e.to_string()))?;
    let hostname = tls_stream
        .get_ref()
        .1
        .server_name()
        .map(ToString::to_string)
        .unwrap_or_else(|| original_dst.ip().to_string());

    serve_requests(tls_stream, hostname, ip4, port, "https", state).await
}

async fn serve_requests<S, B>(
    io: S,
    transport_hostname: String,
    ip4: u32,
    port: u16,
    transport: &'static str,
    state: Arc<ProxyState<B>>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: KernelBackend + 'static,
{
    let io = TokioIo::new(io);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let transport_hostname = transport_hostname.clone();
        async move {
            Ok::<_, std::convert::Infallible>(
                handle_request(req, transport_hostname, ip4, port, transport, state).await,
            )
        }
    });

    http1::Builder::new().serve_connection(io, service).await.map_err(|e| ProxyError::Tls(e.to_string()))?;
    Ok(())
}

async fn handle_request<B: KernelBackend + 'static>(
    req: Request<Incoming>,
    transport_hostname: String,
    ip4: u32,
    port: u16,
    transport: &'static str,
    state: Arc<ProxyState<B>>,
) -> Response<Full<Bytes>> {
    let hostname = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or(transport_hostname);

    state.lsm.connect().note_dns_resolution(ip4, hostname.clone());
    let (effect, _) = state.lsm.connect().evaluate(ip4, port);
    if effect == RuleEffect::Deny {
        log_line(&state.logger, &format!("event=http.request addr={hostname} decision=denied"));
        return text_response(StatusCode::FORBIDDEN, "denied by policy");
    }

    let (mut parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "malformed request body"),
    };

    apply_header_rewrites(&mut parts.headers, &hostname, &state.header_rewrites);

    let content_encoding = parts.headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()).map(str::to_string);
    let snapshot = state.secrets.snapshot();
    let (body_bytes, header_stats) = {
        let header_pairs: Vec<(String, String)> = parts
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let (rewritten, stats) = secrets_apply::substitute_headers(&header_pairs, &snapshot);
        for (name, value) in &rewritten {
            if let Ok(header_name) = hyper::header::HeaderName::from_bytes(name.as_bytes()) {
                if let Ok(header_value) = hyper::header::HeaderValue::from_str(value) {
                    parts.headers.insert(header_name, header_value);
                }
            }
        }
        let (body_bytes, body_stats) = secrets_apply::substitute_body(&body_bytes, content_encoding.as_deref(), &snapshot);
        let mut combined = stats;
        for (id, count) in body_stats.activations {
            *combined.activations.entry(id).or_insert(0) += count;
        }
        (body_bytes, combined)
    };

    if !header_stats.is_empty() {
        let deltas = secrets_apply::activations_delta(&header_stats);
        let updated = state.secrets.replace_stats(&deltas);
        for (id, total) in updated {
            log_line(&state.logger, &format!("event=secret.activation id={id:?} activations={total}"));
        }
    }

    if !body_bytes.is_empty() {
        if let Ok(value) = hyper::header::HeaderValue::from_str(&body_bytes.len().to_string()) {
            parts.headers.insert(CONTENT_LENGTH, value);
        }
    }

    let mcp_ctx = mcp_observer::sniff_request(&body_bytes, &hostname, transport, state.sniff_limit);
    if let Some(ctx) = &mcp_ctx {
        if ctx.kind == McpEventKind::Call {
            let mcp_effect = state.lsm.check_mcp(&ctx.server, &ctx.tool);
            if mcp_effect == RuleEffect::Deny {
                let line = mcp_observer::format_log_line(ctx, None, "denied", Some("denied"), Some("policy_denied"));
                log_line(&state.logger, &line);
                let denied = mcp_observer::policy_denied_response(ctx.id.as_ref());
                return json_response(StatusCode::FORBIDDEN, denied);
            }
            let line = mcp_observer::format_log_line(ctx, None, "forwarded", None, None);
            log_line(&state.logger, &line);
        }
    }

    let scheme = if transport == "https" { "https" } else { "http" };
    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let upstream_uri = match format!("{scheme}://{hostname}:{port}{path_and_query}").parse::<hyper::Uri>() {
        Ok(uri) => uri,
        Err(_) => return text_response(StatusCode::BAD_GATEWAY, "invalid upstream uri"),
    };
    parts.uri = upstream_uri;

    let outbound = Request::from_parts(parts, Full::new(body_bytes));
    match crate::upstream::forward(&state.upstream, outbound).await {
        Ok(response) => {
            log_line(&state.logger, &format!("event=http.request addr={hostname} decision=allowed status={}", response.status()));
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Full::new(body))
        }
        Err(error) => {
            log_line(&state.logger, &format!("event=http.request addr={hostname} decision=error error={error}"));
            text_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

fn apply_header_rewrites(headers: &mut http::HeaderMap, hostname: &str, rewrites: &RwLock<Vec<HeaderRewriteRule>>) {
    let rewrites = rewrites.read().expect("header rewrite lock poisoned");
    for rule in rewrites.iter() {
        if !rule.host.eq_ignore_ascii_case(hostname) {
            continue;
        }
        let Ok(header_name) = hyper::header::HeaderName::from_bytes(rule.header.as_bytes()) else {
            continue;
        };
        let Ok(header_value) = hyper::header::HeaderValue::from_str(&rule.value) else {
            continue;
        };
        headers.insert(header_name, header_value);
    }
}

fn log_line(logger: &SharedLogger, line: &str) {
    let _ = leash_logger::write_through(Some(logger), line);
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
