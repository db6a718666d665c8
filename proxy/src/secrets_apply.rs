//! Substitutes secret placeholders for real values in outbound requests.
//!
//! Placeholders may appear in the URL, in header values, or in the request
//! body. Body substitution is `Content-Encoding`-aware: the body is decoded,
//! substituted as text, then re-encoded with the same encoding. Any failure
//! along that path — oversized body, undecodable encoding, non-UTF-8 content
//! — leaves the original body untouched rather than forwarding a partially
//! substituted one.

use std::collections::HashMap;
use std::io::Read as _;
use std::io::Write as _;

use leash_secrets::SecretsSnapshot;

/// Bodies larger than this are forwarded unmodified; we do not attempt
/// substitution on them.
pub const MAX_BODY_SUBSTITUTION_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct ReplaceStats {
    /// secret id -> number of placeholder occurrences replaced.
    pub activations: HashMap<String, u64>,
}

impl ReplaceStats {
    fn record(&mut self, id: &str, count: u64) {
        if count == 0 {
            return;
        }
        *self.activations.entry(id.to_string()).or_insert(0) += count;
    }

    fn merge(&mut self, other: ReplaceStats) {
        for (id, count) in other.activations {
            self.record(&id, count);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

/// Replaces every known placeholder in `text` with its secret value.
pub fn substitute_text(text: &str, snapshot: &SecretsSnapshot) -> (String, ReplaceStats) {
    let mut stats = ReplaceStats::default();
    if snapshot.placeholder_index.is_empty() {
        return (text.to_string(), stats);
    }
    let mut out = text.to_string();
    for (placeholder, id) in &snapshot.placeholder_index {
        if placeholder.is_empty() {
            continue;
        }
        let Some(secret) = snapshot.secrets.get(id) else {
            continue;
        };
        let occurrences = out.matches(placeholder.as_str()).count() as u64;
        if occurrences == 0 {
            continue;
        }
        out = out.replace(placeholder.as_str(), &secret.value);
        stats.record(id, occurrences);
    }
    (out, stats)
}

/// Substitutes placeholders across a set of header values, returning the
/// rewritten values keyed the same way they were passed in.
pub fn substitute_headers(
    headers: &[(String, String)],
    snapshot: &SecretsSnapshot,
) -> (Vec<(String, String)>, ReplaceStats) {
    let mut stats = ReplaceStats::default();
    let mut out = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        let (replaced, header_stats) = substitute_text(value, snapshot);
        stats.merge(header_stats);
        out.push((name.clone(), replaced));
    }
    (out, stats)
}

/// Substitutes placeholders in a request body, honoring `Content-Encoding`.
/// On any failure (oversize, undecodable encoding, non-UTF-8 content) the
/// original bytes are returned unchanged and `ReplaceStats` is empty.
pub fn substitute_body(
    body: &[u8],
    content_encoding: Option<&str>,
    snapshot: &SecretsSnapshot,
) -> (Vec<u8>, ReplaceStats) {
    if body.len() > MAX_BODY_SUBSTITUTION_BYTES || snapshot.placeholder_index.is_empty() {
        return (body.to_vec(), ReplaceStats::default());
    }
    let Some(decoded) = decode_body(body, content_encoding) else {
        return (body.to_vec(), ReplaceStats::default());
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return (body.to_vec(), ReplaceStats::default());
    };
    let (replaced, stats) = substitute_text(&text, snapshot);
    if stats.is_empty() {
        return (body.to_vec(), ReplaceStats::default());
    }
    match encode_body(replaced.as_bytes(), content_encoding) {
        Some(encoded) => (encoded, stats),
        None => (body.to_vec(), ReplaceStats::default()),
    }
}

fn decode_body(body: &[u8], content_encoding: Option<&str>) -> Option<Vec<u8>> {
    match normalize_encoding(content_encoding) {
        "identity" => Some(body.to_vec()),
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).ok()?;
            Some(out)
        }
        "deflate" => {
            let mut decoder = flate2::read::ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).ok()?;
            Some(out)
        }
        "br" => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut std::io::Cursor::new(body), &mut out).ok()?;
            Some(out)
        }
        _ => None,
    }
}

fn encode_body(body: &[u8], content_encoding: Option<&str>) -> Option<Vec<u8>> {
    match normalize_encoding(content_encoding) {
        "identity" => Some(body.to_vec()),
        "gzip" => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body).ok()?;
            encoder.finish().ok()
        }
        "deflate" => {
            let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body).ok()?;
            encoder.finish().ok()
        }
        "br" => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(body), &mut out, &params).ok()?;
            Some(out)
        }
        _ => None,
    }
}

fn normalize_encoding(content_encoding: Option<&str>) -> &str {
    match content_encoding.map(str::trim) {
        None | Some("") | Some("identity") => "identity",
        Some("gzip") => "gzip",
        Some("deflate") => "deflate",
        Some("br") => "br",
        Some(_) => "unsupported",
    }
}

/// Converts per-id activation counts into the `SecretsManager::replace_stats`
/// input shape.
pub fn activations_delta(stats: &ReplaceStats) -> HashMap<String, u64> {
    stats.activations.clone()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use leash_secrets::SecretsManager;

    fn snapshot_with_one_secret() -> (SecretsSnapshot, String) {
        let manager = SecretsManager::new();
        let secret = manager.upsert("path1", "", "sk-live-xyz").unwrap();
        (manager.snapshot(), secret.placeholder)
    }

    #[test]
    fn substitutes_placeholder_in_plain_text() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let text = format!("Authorization: Bearer {placeholder}");
        let (replaced, stats) = substitute_text(&text, &snapshot);
        assert!(replaced.contains("sk-live-xyz"));
        assert_eq!(stats.activations.values().sum::<u64>(), 1);
    }

    #[test]
    fn leaves_text_without_placeholders_untouched() {
        let (snapshot, _) = snapshot_with_one_secret();
        let (replaced, stats) = substitute_text("no secrets here", &snapshot);
        assert_eq!(replaced, "no secrets here");
        assert!(stats.is_empty());
    }

    #[test]
    fn counts_multiple_occurrences_of_the_same_placeholder() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let text = format!("{placeholder} and again {placeholder}");
        let (_, stats) = substitute_text(&text, &snapshot);
        assert_eq!(stats.activations.values().sum::<u64>(), 2);
    }

    #[test]
    fn oversized_body_is_returned_unchanged() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let mut body = placeholder.into_bytes();
        body.resize(MAX_BODY_SUBSTITUTION_BYTES + 1, b'x');
        let (out, stats) = substitute_body(&body, None, &snapshot);
        assert_eq!(out, body);
        assert!(stats.is_empty());
    }

    #[test]
    fn substitutes_plain_body_with_no_encoding() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let body = format!("{{\"token\":\"{placeholder}\"}}").into_bytes();
        let (out, stats) = substitute_body(&body, None, &snapshot);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("sk-live-xyz"));
        assert!(!stats.is_empty());
    }

    #[test]
    fn round_trips_gzip_encoded_body() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let plain = format!("{{\"token\":\"{placeholder}\"}}");
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(plain.as_bytes()).unwrap();
        let gzipped = encoder.finish().unwrap();

        let (out, stats) = substitute_body(&gzipped, Some("gzip"), &snapshot);
        assert!(!stats.is_empty());
        let mut decoder = flate2::read::GzDecoder::new(out.as_slice());
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert!(decoded.contains("sk-live-xyz"));
    }

    #[test]
    fn unsupported_encoding_is_left_untouched() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let body = placeholder.into_bytes();
        let (out, stats) = substitute_body(&body, Some("compress"), &snapshot);
        assert_eq!(out, body);
        assert!(stats.is_empty());
    }

    #[test]
    fn round_trips_brotli_encoded_body() {
        let (snapshot, placeholder) = snapshot_with_one_secret();
        let plain = format!("{{\"token\":\"{placeholder}\"}}");
        let mut compressed = Vec::new();
        let params = brotli::enc::BrotliEncoderParams::default();
        brotli::BrotliCompress(&mut std::io::Cursor::new(plain.as_bytes()), &mut compressed, &params).unwrap();

        let (out, stats) = substitute_body(&compressed, Some("br"), &snapshot);
        assert!(!stats.is_empty());
        let mut decoded = Vec::new();
        brotli::BrotliDecompress(&mut std::io::Cursor::new(out.as_slice()), &mut decoded).unwrap();
        assert!(String::from_utf8(decoded).unwrap().contains("sk-live-xyz"));
    }

    #[test]
    fn non_utf8_body_is_left_untouched() {
        let (snapshot, _) = snapshot_with_one_secret();
        let body = vec![0xff, 0xfe, 0xfd];
        let (out, stats) = substitute_body(&body, None, &snapshot);
        assert_eq!(out, body);
        assert!(stats.is_empty());
    }
}
