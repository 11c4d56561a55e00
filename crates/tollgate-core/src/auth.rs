use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;

use tollgate_common::ApiKeySettings;

use crate::engine::CallerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing api key")]
    Missing,
    #[error("invalid api key")]
    Invalid,
}

#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub name: Option<String>,
    pub caller: CallerIdentity,
}

/// Bearer keys by blake3 hex digest. Plaintext keys are never held.
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub keys_by_hash: HashMap<String, KeyEntry>,
}

impl AuthSnapshot {
    pub fn from_settings(keys: &[ApiKeySettings]) -> Self {
        Self {
            keys_by_hash: keys
                .iter()
                .map(|key| {
                    (
                        key.key_hash.trim().to_ascii_lowercase(),
                        KeyEntry {
                            name: key.name.clone(),
                            caller: CallerIdentity {
                                user_id: key.user_id,
                                organization_id: key.organization_id,
                            },
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct KeyAuth {
    snapshot: ArcSwap<AuthSnapshot>,
}

impl KeyAuth {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<CallerIdentity, AuthError> {
        let key = extract_api_key(headers).ok_or(AuthError::Missing)?;
        let snapshot = self.snapshot.load();
        snapshot
            .keys_by_hash
            .get(&hash_api_key(&key))
            .map(|entry| entry.caller)
            .ok_or(AuthError::Invalid)
    }
}

pub fn hash_api_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use uuid::Uuid;

    fn auth() -> KeyAuth {
        KeyAuth::new(AuthSnapshot::from_settings(&[ApiKeySettings {
            name: Some("dev".to_string()),
            key_hash: hash_api_key("sk-test"),
            user_id: Uuid::from_u128(1),
            organization_id: Uuid::from_u128(2),
        }]))
    }

    #[test]
    fn bearer_key_resolves_caller() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-test"));
        let caller = auth().authenticate(&headers).unwrap();
        assert_eq!(caller.user_id, Uuid::from_u128(1));
        assert_eq!(caller.organization_id, Uuid::from_u128(2));
    }

    #[test]
    fn x_api_key_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-test"));
        assert!(auth().authenticate(&headers).is_ok());
    }

    #[test]
    fn missing_and_unknown_keys_are_rejected() {
        let auth = auth();
        assert_eq!(auth.authenticate(&HeaderMap::new()), Err(AuthError::Missing));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-other"));
        assert_eq!(auth.authenticate(&headers), Err(AuthError::Invalid));
    }

    #[test]
    fn replaced_snapshot_revokes_old_keys() {
        let auth = auth();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-test"));
        assert!(auth.authenticate(&headers).is_ok());

        auth.replace_snapshot(AuthSnapshot::default());
        assert_eq!(auth.authenticate(&headers), Err(AuthError::Invalid));
    }
}
