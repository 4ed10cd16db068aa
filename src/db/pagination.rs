//! Opaque continuation-token pagination.
//!
//! No teacher counterpart exists for this (`list_conversations`/`get_messages`
//! in the teacher are unpaginated); the encoding reuses crates already in the
//! teacher's stack (`base64`, `serde_json`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub last_key: String,
    pub last_sort_value: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("Cursor serializes infallibly");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, String> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| format!("invalid continuation token: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid continuation token: {e}"))
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation_token: Option<String>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let cursor = Cursor {
            last_key: "thread-1".to_string(),
            last_sort_value: "2026-01-01T00:00:00Z".to_string(),
        };
        let token = cursor.encode();
        let decoded = Cursor::decode(&token).unwrap();
        assert_eq!(decoded.last_key, cursor.last_key);
        assert_eq!(decoded.last_sort_value, cursor.last_sort_value);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Cursor::decode("not-a-valid-token!!!").is_err());
    }
}
