//! Observes MCP (Model Context Protocol) JSON-RPC 2.0 traffic carried over
//! plain `application/json` requests/responses or `text/event-stream` SSE
//! bodies, and synthesizes the `mcp.call`/`mcp.notification`/`mcp.discover`
//! log lines and deny responses the proxy needs.
//!
//! Sniffing is bounded: request/response bodies beyond `SniffLimit` are
//! never parsed as JSON-RPC, and a single SSE event accumulating past
//! `SSEEventLimit` is dropped rather than buffered without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

/// Default cap on request/response body bytes considered for JSON-RPC
/// sniffing.
pub const DEFAULT_SNIFF_LIMIT: usize = 32 * 1024;
/// Default cap on the accumulated bytes of a single SSE `data:` event.
pub const DEFAULT_SSE_EVENT_LIMIT: usize = 32 * 1024;

#[derive(Debug, Deserialize)]
struct JsonRpcEnvelope {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpEventKind {
    Call,
    Notification,
    Discover,
}

impl McpEventKind {
    pub fn as_event_name(self) -> &'static str {
        match self {
            McpEventKind::Call => "mcp.call",
            McpEventKind::Notification => "mcp.notification",
            McpEventKind::Discover => "mcp.discover",
        }
    }
}

/// Per-request context built when a request body sniffs as JSON-RPC.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub kind: McpEventKind,
    pub method: String,
    pub server: String,
    pub tool: String,
    pub id: Option<Value>,
    pub transport: &'static str,
    pub proto: String,
    pub sampled: bool,
}

/// Attempts to sniff a JSON-RPC 2.0 envelope out of a request body.
/// Returns `None` when the body exceeds `limit` or does not parse.
pub fn sniff_request(body: &[u8], server: &str, transport: &'static str, limit: usize) -> Option<RequestContext> {
    if body.len() > limit {
        return None;
    }
    let envelope: JsonRpcEnvelope = serde_json::from_slice(body).ok()?;
    let method = envelope.method?;
    let tool = envelope
        .params
        .as_ref()
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = classify(&method, envelope.id.is_some());
    Some(RequestContext {
        kind,
        method,
        server: server.to_string(),
        tool,
        id: envelope.id,
        transport,
        proto: "2.0".to_string(),
        sampled: true,
    })
}

fn classify(method: &str, has_id: bool) -> McpEventKind {
    if method == "tools/call" {
        McpEventKind::Call
    } else if !has_id || method.starts_with("notifications/") {
        McpEventKind::Notification
    } else if method.ends_with("/list") {
        McpEventKind::Discover
    } else {
        McpEventKind::Call
    }
}

/// Builds the JSON-RPC 2.0 error object body for a `tools/call` request
/// denied by policy, per the `-32000` application-error convention.
pub fn policy_denied_response(id: Option<&Value>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {
            "code": -32000,
            "message": "denied by policy",
        }
    })
}

/// Truncates a session id to the first 8 characters for log lines, per the
/// observer's session-id redaction rule.
pub fn truncate_session_id(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

/// Tracks live MCP sessions keyed by the full `Mcp-Session-Id` header value.
/// A session's lifetime is the last-seen span of its associated SSE stream.
#[derive(Debug, Clone)]
pub struct McpSession {
    pub id: String,
    pub server: String,
    pub proto: String,
    pub tool: String,
    pub sampled: bool,
    pub started: Instant,
}

#[derive(Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<String, McpSession>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, session: McpSession) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<McpSession> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<McpSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(session_id)
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Incrementally parses an SSE body, attributing each `data:` event to a
/// JSON-RPC envelope. A single event's accumulated bytes are capped at
/// `limit`; events beyond the cap are dropped without being parsed.
pub struct SseEventParser {
    buffer: String,
    pending_data: String,
    limit: usize,
    dropped_current_event: bool,
}

impl SseEventParser {
    pub fn new(limit: usize) -> Self {
        Self { buffer: String::new(), pending_data: String::new(), limit, dropped_current_event: false }
    }

    /// Feeds a chunk of bytes (assumed UTF-8; non-UTF-8 chunks are ignored)
    /// and returns every complete JSON-RPC envelope parsed out of completed
    /// events in this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<JsonRpcEnvelopeOwned> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let event_block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(envelope) = self.finish_event(&event_block) {
                out.push(envelope);
            }
        }
        out
    }

    fn finish_event(&mut self, event_block: &str) -> Option<JsonRpcEnvelopeOwned> {
        for line in event_block.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if self.pending_data.len() + data.len() > self.limit {
                    self.dropped_current_event = true;
                    continue;
                }
                self.pending_data.push_str(data);
            }
        }

        let dropped = self.dropped_current_event;
        self.dropped_current_event = false;
        let data = std::mem::take(&mut self.pending_data);
        if dropped || data.is_empty() {
            return None;
        }
        let envelope: JsonRpcEnvelope = serde_json::from_str(&data).ok()?;
        Some(JsonRpcEnvelopeOwned { method: envelope.method, id: envelope.id, params: envelope.params })
    }
}

#[derive(Debug, Clone)]
pub struct JsonRpcEnvelopeOwned {
    pub method: Option<String>,
    pub id: Option<Value>,
    pub params: Option<Value>,
}

/// Formats an observed MCP event into a logfmt line.
pub fn format_log_line(
    ctx: &RequestContext,
    session_id: Option<&str>,
    outcome: &str,
    decision: Option<&str>,
    error: Option<&str>,
) -> String {
    let mut line = format!("event={} tool={:?} server={:?} outcome={outcome}", ctx.kind.as_event_name(), ctx.tool, ctx.server);
    if let Some(session_id) = session_id {
        line.push_str(&format!(" session={}", truncate_session_id(session_id)));
    }
    line.push_str(&format!(" transport={}", ctx.transport));
    if let Some(decision) = decision {
        line.push_str(&format!(" decision={decision}"));
    }
    if let Some(error) = error {
        line.push_str(&format!(" error={error:?}"));
    }
    line
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn sniffs_tools_call_request() {
        let body = br#"{"jsonrpc":"2.0","id":"1","method":"tools/call","params":{"name":"resolve-library-id"}}"#;
        let ctx = sniff_request(body, "mcp.context7.com", "http", DEFAULT_SNIFF_LIMIT).expect("sniffed");
        assert_eq!(ctx.kind, McpEventKind::Call);
        assert_eq!(ctx.tool, "resolve-library-id");
        assert_eq!(ctx.server, "mcp.context7.com");
    }

    #[test]
    fn sniffs_notification_without_id() {
        let body = br#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#;
        let ctx = sniff_request(body, "x", "http", DEFAULT_SNIFF_LIMIT).expect("sniffed");
        assert_eq!(ctx.kind, McpEventKind::Notification);
    }

    #[test]
    fn sniffs_list_methods_as_discover() {
        let body = br#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#;
        let ctx = sniff_request(body, "x", "http", DEFAULT_SNIFF_LIMIT).expect("sniffed");
        assert_eq!(ctx.kind, McpEventKind::Discover);
    }

    #[test]
    fn oversized_body_is_not_sniffed() {
        let body = vec![b'{'; DEFAULT_SNIFF_LIMIT + 1];
        assert!(sniff_request(&body, "x", "http", DEFAULT_SNIFF_LIMIT).is_none());
    }

    #[test]
    fn non_json_body_is_not_sniffed() {
        assert!(sniff_request(b"not json", "x", "http", DEFAULT_SNIFF_LIMIT).is_none());
    }

    #[test]
    fn policy_denied_response_has_application_error_code() {
        let response = policy_denied_response(Some(&Value::String("1".to_string())));
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["id"], "1");
    }

    #[test]
    fn session_id_truncates_to_eight_chars() {
        assert_eq!(truncate_session_id("0123456789abcdef"), "01234567");
        assert_eq!(truncate_session_id("abc"), "abc");
    }

    #[test]
    fn session_tracker_round_trips() {
        let tracker = SessionTracker::new();
        tracker.track(McpSession {
            id: "sess-1".to_string(),
            server: "mcp.context7.com".to_string(),
            proto: "2.0".to_string(),
            tool: "resolve-library-id".to_string(),
            sampled: true,
            started: Instant::now(),
        });
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get("sess-1").is_some());
        assert!(tracker.remove("sess-1").is_some());
        assert!(tracker.is_empty());
    }

    #[test]
    fn sse_parser_emits_envelope_on_blank_line() {
        let mut parser = SseEventParser::new(DEFAULT_SSE_EVENT_LIMIT);
        let chunk = b"data: {\"jsonrpc\":\"2.0\",\"method\":\"tools/call\",\"id\":1}\n\n";
        let events = parser.feed(chunk);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method.as_deref(), Some("tools/call"));
    }

    #[test]
    fn sse_parser_handles_multiple_events_across_feeds() {
        let mut parser = SseEventParser::new(DEFAULT_SSE_EVENT_LIMIT);
        let mut events = parser.feed(b"data: {\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n\n");
        events.extend(parser.feed(b"data: {\"jsonrpc\":\"2.0\",\"method\":\"b\"}\n\n"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].method.as_deref(), Some("a"));
        assert_eq!(events[1].method.as_deref(), Some("b"));
    }

    #[test]
    fn sse_parser_drops_event_exceeding_limit() {
        let mut parser = SseEventParser::new(8);
        let chunk = b"data: {\"jsonrpc\":\"2.0\",\"method\":\"too-long\"}\n\n";
        let events = parser.feed(chunk);
        assert!(events.is_empty());
    }

    #[test]
    fn format_log_line_includes_truncated_session() {
        let ctx = RequestContext {
            kind: McpEventKind::Call,
            method: "tools/call".to_string(),
            server: "mcp.context7.com".to_string(),
            tool: "resolve-library-id".to_string(),
            id: None,
            transport: "http",
            proto: "2.0".to_string(),
            sampled: true,
        };
        let line = format_log_line(&ctx, Some("0123456789"), "denied", Some("denied"), Some("policy_denied"));
        assert!(line.contains("event=mcp.call"));
        assert!(line.contains("tool=\"resolve-library-id\""));
        assert!(line.contains("session=01234567"));
        assert!(line.contains("error=\"policy_denied\""));
    }
}
