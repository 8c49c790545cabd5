//! Wire messages exchanged with the OCR child process.
//!
//! The child speaks newline-delimited JSON: exactly one readiness object at
//! startup, then one response object per request, correlated by `id`. Anything
//! else on stdout is diagnostic noise and is dropped by the reader.

use rand::Rng as _;

use crate::prelude::*;

/// One request line written to the child's stdin.
#[derive(Debug, Serialize)]
pub(crate) struct OcrRequest<'a> {
    pub id: &'a str,
    pub pdf_path: &'a Path,
}

/// A parsed line from the child's stdout.
///
/// The readiness handshake and job responses share the stream; the `ready`
/// and `id` fields discriminate them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ChildMessage {
    Ready {
        ready: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Response {
        id: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        page_count: Option<u32>,
        #[serde(default)]
        error: Option<String>,
    },
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Generate a random lowercase hex id of `len` characters.
///
/// `rand`'s thread-local generator is cryptographically secure, so ids are
/// unguessable and collisions within a worker's pending map are not a
/// practical concern.
pub fn random_request_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| HEX_DIGITS[rng.random_range(0..HEX_DIGITS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_hex_of_requested_length() {
        let id = random_request_id(16);
        assert_eq!(id.len(), 16);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn readiness_and_response_lines_parse() {
        let ready: ChildMessage = serde_json::from_str(r#"{"ready": true}"#).unwrap();
        assert!(matches!(ready, ChildMessage::Ready { ready: true, .. }));

        let failed: ChildMessage =
            serde_json::from_str(r#"{"ready": false, "error": "no models"}"#).unwrap();
        match failed {
            ChildMessage::Ready { ready, error } => {
                assert!(!ready);
                assert_eq!(error.as_deref(), Some("no models"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let response: ChildMessage = serde_json::from_str(
            r#"{"id": "00ff", "text": "bonjour", "page_count": 3}"#,
        )
        .unwrap();
        match response {
            ChildMessage::Response {
                id,
                text,
                page_count,
                error,
            } => {
                assert_eq!(id, "00ff");
                assert_eq!(text.as_deref(), Some("bonjour"));
                assert_eq!(page_count, Some(3));
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn null_ids_are_rejected_as_malformed() {
        // The engine answers unparseable requests with `"id": null`; those
        // lines must not match any pending job.
        let parsed =
            serde_json::from_str::<ChildMessage>(r#"{"id": null, "error": "bad"}"#);
        assert!(parsed.is_err());
    }
}
