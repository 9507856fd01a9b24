//! Frame codec: parse inbound UTF-8 text into a typed [`Frame`].
//!
//! Every parse failure except the payload ceiling maps to an
//! `INVALID_REQUEST` response on an open socket; oversized input is the one
//! condition that also closes the connection (code 1009).

use crate::{Frame, RequestFrame};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Inbound text exceeded the configured payload ceiling.
    #[error("payload of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: usize, limit: usize },
    /// Malformed JSON, missing/unknown `type`, or a request without
    /// `id`/`method`.
    #[error("invalid frame: {0}")]
    Invalid(String),
}

/// Parse one inbound text message into a [`Frame`], enforcing `max_payload`.
pub fn parse_frame(text: &str, max_payload: usize) -> Result<Frame, FrameError> {
    if text.len() > max_payload {
        return Err(FrameError::TooLarge {
            len: text.len(),
            limit: max_payload,
        });
    }
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| FrameError::Invalid(e.to_string()))?;
    if let Frame::Request(ref req) = frame {
        validate_request(req)?;
    }
    Ok(frame)
}

fn validate_request(req: &RequestFrame) -> Result<(), FrameError> {
    if req.id.is_empty() {
        return Err(FrameError::Invalid("request is missing 'id'".into()));
    }
    if req.method.is_empty() {
        return Err(FrameError::Invalid("request is missing 'method'".into()));
    }
    Ok(())
}

/// Serialize an outbound frame to JSON text, exactly once per logical
/// message. WebSocket framing handles large payloads; no chunking here.
pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::MAX_PAYLOAD_BYTES;

    #[test]
    fn parses_request() {
        let frame = parse_frame(
            r#"{"type":"req","id":"1","method":"health"}"#,
            MAX_PAYLOAD_BYTES,
        )
        .unwrap();
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.id, "1");
                assert_eq!(req.method, "health");
                assert!(req.params.is_none());
            },
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn parses_event() {
        let frame = parse_frame(
            r#"{"type":"event","event":"tick","payload":{"ts":1},"seq":3}"#,
            MAX_PAYLOAD_BYTES,
        )
        .unwrap();
        match frame {
            Frame::Event(ev) => {
                assert_eq!(ev.event, "tick");
                assert_eq!(ev.seq, Some(3));
            },
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_frame("{not json", MAX_PAYLOAD_BYTES).unwrap_err();
        assert!(matches!(err, FrameError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse_frame(r#"{"type":"ping"}"#, MAX_PAYLOAD_BYTES).unwrap_err();
        assert!(matches!(err, FrameError::Invalid(_)));
    }

    #[test]
    fn rejects_missing_type() {
        let err = parse_frame(r#"{"id":"1","method":"health"}"#, MAX_PAYLOAD_BYTES).unwrap_err();
        assert!(matches!(err, FrameError::Invalid(_)));
    }

    #[test]
    fn rejects_request_without_id() {
        let err = parse_frame(r#"{"type":"req","id":"","method":"health"}"#, MAX_PAYLOAD_BYTES)
            .unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn rejects_request_without_method() {
        let err =
            parse_frame(r#"{"type":"req","id":"1","method":""}"#, MAX_PAYLOAD_BYTES).unwrap_err();
        assert!(err.to_string().contains("method"));
    }

    #[test]
    fn rejects_oversized_payload() {
        let big = format!(
            r#"{{"type":"req","id":"1","method":"health","params":{{"pad":"{}"}}}}"#,
            "x".repeat(128)
        );
        let err = parse_frame(&big, 64).unwrap_err();
        match err {
            FrameError::TooLarge { len, limit } => {
                assert!(len > limit);
                assert_eq!(limit, 64);
            },
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn encode_round_trip() {
        let frame = Frame::Request(RequestFrame {
            id: "9".into(),
            method: "chat.send".into(),
            params: Some(serde_json::json!({"sessionKey":"main"})),
        });
        let text = encode_frame(&frame).unwrap();
        let back = parse_frame(&text, MAX_PAYLOAD_BYTES).unwrap();
        match back {
            Frame::Request(req) => assert_eq!(req.method, "chat.send"),
            other => panic!("expected request, got {other:?}"),
        }
    }
}
