//! In-memory secret store: owns secret lifecycle and placeholder
//! uniqueness so the MITM proxy can substitute opaque placeholders for
//! real values without ever persisting the values themselves.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::Rng;
use regex_lite::Regex;
use thiserror::Error;

/// Placeholders (and real secret ids) are restricted to this alphabet so
/// they are safe to splice into URLs, headers, and JSON bodies unescaped.
fn id_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"))
}

const PLACEHOLDER_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MIN_PLACEHOLDER_LEN: usize = 32;
const MAX_GENERATION_ATTEMPTS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretsError {
    #[error("invalid secret id: must match ^[A-Za-z0-9_]+$")]
    InvalidId,
    #[error("secret not found")]
    NotFound,
    #[error("secret id already in use")]
    Conflict,
    #[error("failed to generate a unique placeholder after {MAX_GENERATION_ATTEMPTS} attempts")]
    PlaceholderExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub id: String,
    pub value: String,
    pub placeholder: String,
    pub activations: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SecretsSnapshot {
    pub secrets: HashMap<String, Secret>,
    pub placeholder_index: HashMap<String, String>,
}

#[derive(Default)]
struct SecretsState {
    secrets: HashMap<String, Secret>,
    /// placeholder -> id, kept consistent with `secrets` under the same lock.
    placeholder_index: HashMap<String, String>,
}

/// Owns the live set of secrets. All mutation goes through `&self` methods
/// backed by a single `RwLock`; readers get consistent point-in-time
/// snapshots or O(1) lookups, never a partially-updated view.
#[derive(Default)]
pub struct SecretsManager {
    state: RwLock<SecretsState>,
}

impl SecretsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates a secret, optionally renaming it.
    ///
    /// `path_id` identifies the existing entry (if any) to update. When
    /// `body_id` is non-empty and differs from `path_id`, the entry is
    /// renamed to `body_id`. The id actually used to key the store — the
    /// rename target when renaming, otherwise `path_id` — must match
    /// `^[A-Za-z0-9_]+$`.
    pub fn upsert(&self, path_id: &str, body_id: &str, value: &str) -> Result<Secret, SecretsError> {
        let path_id = path_id.trim();
        let body_id = body_id.trim();
        let target_id = if !body_id.is_empty() { body_id } else { path_id };

        if !id_pattern().is_match(target_id) {
            return Err(SecretsError::InvalidId);
        }

        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());

        match state.secrets.get(path_id).cloned() {
            Some(mut secret) => {
                let renamed = target_id != path_id;
                if renamed && state.secrets.contains_key(target_id) {
                    return Err(SecretsError::Conflict);
                }

                let value_changed = secret.value != value;
                if value_changed {
                    if !secret.placeholder.is_empty() {
                        state.placeholder_index.remove(&secret.placeholder);
                    }
                    let previous_placeholder = secret.placeholder.clone();
                    secret.placeholder =
                        generate_placeholder(value, &state.placeholder_index, Some(&previous_placeholder))?;
                    secret.value = value.to_string();
                    if !secret.placeholder.is_empty() {
                        state
                            .placeholder_index
                            .insert(secret.placeholder.clone(), target_id.to_string());
                    }
                } else if !secret.placeholder.is_empty() {
                    // Placeholder and activations are preserved verbatim; only
                    // the index key needs to follow a rename.
                    state.placeholder_index.remove(&secret.placeholder);
                    state
                        .placeholder_index
                        .insert(secret.placeholder.clone(), target_id.to_string());
                }

                secret.id = target_id.to_string();
                state.secrets.remove(path_id);
                state.secrets.insert(target_id.to_string(), secret.clone());
                Ok(secret)
            }
            None => {
                if state.secrets.contains_key(target_id) {
                    return Err(SecretsError::Conflict);
                }
                let placeholder = generate_placeholder(value, &state.placeholder_index, None)?;
                let secret = Secret {
                    id: target_id.to_string(),
                    value: value.to_string(),
                    placeholder: placeholder.clone(),
                    activations: 0,
                };
                if !placeholder.is_empty() {
                    state
                        .placeholder_index
                        .insert(placeholder, target_id.to_string());
                }
                state.secrets.insert(target_id.to_string(), secret.clone());
                Ok(secret)
            }
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), SecretsError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SecretsError::InvalidId);
        }

        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        match state.secrets.remove(id) {
            Some(secret) => {
                if !secret.placeholder.is_empty() {
                    state.placeholder_index.remove(&secret.placeholder);
                }
                Ok(())
            }
            None => Err(SecretsError::NotFound),
        }
    }

    pub fn snapshot(&self) -> SecretsSnapshot {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        SecretsSnapshot {
            secrets: state.secrets.clone(),
            placeholder_index: state.placeholder_index.clone(),
        }
    }

    /// Atomically adds positive deltas to the live activation counters.
    /// Zero deltas and unknown ids are ignored. Returns the post-increment
    /// total for every id that was actually updated.
    pub fn replace_stats(&self, deltas: &HashMap<String, u64>) -> HashMap<String, u64> {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let mut updated = HashMap::with_capacity(deltas.len());
        for (id, delta) in deltas {
            if *delta == 0 {
                continue;
            }
            if let Some(secret) = state.secrets.get_mut(id) {
                secret.activations = secret.activations.saturating_add(*delta);
                updated.insert(id.clone(), secret.activations);
            }
        }
        updated
    }

    pub fn lookup_by_placeholder(&self, placeholder: &str) -> Option<Secret> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        let id = state.placeholder_index.get(placeholder)?;
        state.secrets.get(id).cloned()
    }
}

/// Draws a random lowercase-alphanumeric placeholder of length
/// `max(value.len(), 32)`, rejecting duplicates already live in `index`
/// and the entry's own previous placeholder, up to 64 attempts.
fn generate_placeholder(
    value: &str,
    index: &HashMap<String, String>,
    previous: Option<&str>,
) -> Result<String, SecretsError> {
    if value.is_empty() {
        return Ok(String::new());
    }

    let len = value.len().max(MIN_PLACEHOLDER_LEN);
    let mut rng = rand::rng();

    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let candidate: String = (0..len)
            .map(|_| {
                let idx = rng.random_range(0..PLACEHOLDER_ALPHABET.len());
                PLACEHOLDER_ALPHABET[idx] as char
            })
            .collect();

        if index.contains_key(&candidate) {
            continue;
        }
        if previous.is_some_and(|p| p == candidate) {
            continue;
        }
        return Ok(candidate);
    }

    Err(SecretsError::PlaceholderExhausted)
}
