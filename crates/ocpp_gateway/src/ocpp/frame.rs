use crate::ocpp::OcppVersion;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Largest unique id allowed by the OCPP-J RPC framework.
pub const MAX_UNIQUE_ID_LEN: usize = 36;

/// Default upper bound for a single frame in either direction.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    fn malformed(reason: impl Into<String>) -> Self {
        FrameError::Malformed(reason.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_id(id: u64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements a frame of this type carries.
    fn arity(&self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// Framing summary of a decoded frame. The payload itself is never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Call { unique_id: String, action: String },
    CallResult { unique_id: String },
    CallError { unique_id: String, error_code: String },
}

impl Envelope {
    pub fn unique_id(&self) -> &str {
        match self {
            Envelope::Call { unique_id, .. }
            | Envelope::CallResult { unique_id }
            | Envelope::CallError { unique_id, .. } => unique_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call { .. } => MessageType::Call,
            Envelope::CallResult { .. } => MessageType::CallResult,
            Envelope::CallError { .. } => MessageType::CallError,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Call { unique_id, action } => write!(f, "CALL {action} [{unique_id}]"),
            Envelope::CallResult { unique_id } => write!(f, "CALLRESULT [{unique_id}]"),
            Envelope::CallError {
                unique_id,
                error_code,
            } => write!(f, "CALLERROR {error_code} [{unique_id}]"),
        }
    }
}

/// A validated device frame: its envelope plus the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub envelope: Envelope,
    pub payload: Bytes,
}

/// Encoder/decoder for one negotiated OCPP-J subprotocol.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    version: OcppVersion,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(version: OcppVersion) -> Self {
        Self {
            version,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Validates a device frame and keeps its bytes untouched.
    pub fn decode(&self, raw: Bytes) -> Result<Frame, FrameError> {
        self.check_size(raw.len())?;
        let text = std::str::from_utf8(&raw)
            .map_err(|e| FrameError::malformed(format!("frame is not UTF-8: {e}")))?;
        let envelope = self.parse_envelope(text)?;
        Ok(Frame {
            envelope,
            payload: raw,
        })
    }

    /// Produces the text frame for a broker payload.
    ///
    /// Broker payloads are relayed as-is; only the transport constraints
    /// (UTF-8 text, size) are enforced here.
    pub fn encode(&self, payload: &[u8]) -> Result<String, FrameError> {
        self.check_size(payload.len())?;
        String::from_utf8(payload.to_vec())
            .map_err(|e| FrameError::malformed(format!("payload is not UTF-8: {e}")))
    }

    /// Best-effort envelope of an outgoing payload, for logging.
    pub fn sniff(&self, text: &str) -> Option<Envelope> {
        self.parse_envelope(text).ok()
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }

    fn parse_envelope(&self, text: &str) -> Result<Envelope, FrameError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FrameError::malformed(format!("invalid JSON: {e}")))?;
        let Value::Array(items) = value else {
            return Err(FrameError::malformed("frame is not a JSON array"));
        };

        let message_type = items
            .first()
            .and_then(Value::as_u64)
            .and_then(MessageType::from_id)
            .ok_or_else(|| FrameError::malformed("missing or unknown message type id"))?;

        if items.len() != message_type.arity() {
            return Err(FrameError::malformed(format!(
                "{:?} frame has {} elements, expected {}",
                message_type,
                items.len(),
                message_type.arity()
            )));
        }

        let unique_id = parse_unique_id(&items[1])?;

        match message_type {
            MessageType::Call => {
                let action = items[2]
                    .as_str()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| FrameError::malformed("CALL action must be a non-empty string"))?
                    .to_string();
                require_object(&items[3], "CALL payload")?;
                Ok(Envelope::Call { unique_id, action })
            }
            MessageType::CallResult => {
                require_object(&items[2], "CALLRESULT payload")?;
                Ok(Envelope::CallResult { unique_id })
            }
            MessageType::CallError => {
                let error_code = items[2]
                    .as_str()
                    .ok_or_else(|| FrameError::malformed("CALLERROR code must be a string"))?;
                if !self.version.is_valid_error_code(error_code) {
                    return Err(FrameError::malformed(format!(
                        "error code {error_code} is not defined for {}",
                        self.version
                    )));
                }
                if !items[3].is_string() {
                    return Err(FrameError::malformed(
                        "CALLERROR description must be a string",
                    ));
                }
                require_object(&items[4], "CALLERROR details")?;
                Ok(Envelope::CallError {
                    unique_id,
                    error_code: error_code.to_string(),
                })
            }
        }
    }
}

fn parse_unique_id(value: &Value) -> Result<String, FrameError> {
    let unique_id = value
        .as_str()
        .ok_or_else(|| FrameError::malformed("unique id must be a string"))?;
    if unique_id.is_empty() || unique_id.chars().count() > MAX_UNIQUE_ID_LEN {
        return Err(FrameError::malformed(format!(
            "unique id must be 1..={MAX_UNIQUE_ID_LEN} characters"
        )));
    }
    Ok(unique_id.to_string())
}

fn require_object(value: &Value, what: &str) -> Result<(), FrameError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(FrameError::malformed(format!("{what} must be a JSON object")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(version: OcppVersion, raw: &str) -> Result<Frame, FrameError> {
        FrameCodec::new(version).decode(Bytes::copy_from_slice(raw.as_bytes()))
    }

    #[test]
    fn test_decode_call() {
        let frame = decode(
            OcppVersion::V16,
            r#"[2,"19223201","BootNotification",{"chargePointVendor":"VendorX","chargePointModel":"M1"}]"#,
        )
        .unwrap();
        assert_eq!(
            frame.envelope,
            Envelope::Call {
                unique_id: "19223201".to_string(),
                action: "BootNotification".to_string()
            }
        );
        assert_eq!(frame.envelope.message_type(), MessageType::Call);
    }

    #[test]
    fn test_decode_call_result_and_error() {
        let result = decode(OcppVersion::V201, r#"[3,"abc",{"currentTime":"2024-01-01T00:00:00Z"}]"#).unwrap();
        assert_eq!(result.envelope.unique_id(), "abc");
        assert_eq!(result.envelope.message_type(), MessageType::CallResult);

        let error = decode(
            OcppVersion::V201,
            r#"[4,"abc","RpcFrameworkError","bad frame",{}]"#,
        )
        .unwrap();
        assert_eq!(
            error.envelope,
            Envelope::CallError {
                unique_id: "abc".to_string(),
                error_code: "RpcFrameworkError".to_string()
            }
        );
    }

    #[test]
    fn test_round_trip_preserves_bytes_for_each_version() {
        let frames = [
            (OcppVersion::V16, r#"[2, "1", "Heartbeat", {}]"#),
            (OcppVersion::V16, r#"[4,"2","OccurenceConstraintViolation","",{"k":[1,2]}]"#),
            (OcppVersion::V20, r#"[3,"3",{"status":"Accepted","nested":{"a":1.50}}]"#),
            (OcppVersion::V201, "[2,\"4\",\"StatusNotification\",{\"evseId\":1}]"),
            (OcppVersion::V201, r#"[4,"5","FormatViolation","unicode ✓",{}]"#),
        ];

        for (version, raw) in frames {
            let codec = FrameCodec::new(version);
            let frame = codec.decode(Bytes::copy_from_slice(raw.as_bytes())).unwrap();
            let encoded = codec.encode(&frame.payload).unwrap();
            assert_eq!(encoded, raw, "round trip changed bytes for {version}");
        }
    }

    #[test]
    fn test_decode_rejects_structural_violations() {
        let cases = [
            "",
            "not json",
            r#"{"x":1}"#,
            "[]",
            r#"[5,"1","Heartbeat",{}]"#,
            r#"["2","1","Heartbeat",{}]"#,
            r#"[2,"1","Heartbeat"]"#,
            r#"[2,"1","Heartbeat",{},{}]"#,
            r#"[2,1,"Heartbeat",{}]"#,
            r#"[2,"","Heartbeat",{}]"#,
            r#"[2,"1","",{}]"#,
            r#"[2,"1","Heartbeat",[]]"#,
            r#"[3,"1","ok"]"#,
            r#"[4,"1","GenericError",null,{}]"#,
            r#"[4,"1","GenericError","desc","details"]"#,
        ];
        for raw in cases {
            let result = decode(OcppVersion::V16, raw);
            assert!(
                matches!(result, Err(FrameError::Malformed(_))),
                "expected malformed for {raw:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn test_unique_id_length_limit() {
        let ok_id = "a".repeat(MAX_UNIQUE_ID_LEN);
        let long_id = "a".repeat(MAX_UNIQUE_ID_LEN + 1);
        assert!(decode(OcppVersion::V16, &format!(r#"[2,"{ok_id}","Heartbeat",{{}}]"#)).is_ok());
        assert!(decode(OcppVersion::V16, &format!(r#"[2,"{long_id}","Heartbeat",{{}}]"#)).is_err());
    }

    #[test]
    fn test_error_code_must_match_version() {
        let v16_code = r#"[4,"1","FormationViolation","",{}]"#;
        assert!(decode(OcppVersion::V16, v16_code).is_ok());
        assert!(decode(OcppVersion::V201, v16_code).is_err());

        let v2_code = r#"[4,"1","MessageTypeNotSupported","",{}]"#;
        assert!(decode(OcppVersion::V20, v2_code).is_ok());
        assert!(decode(OcppVersion::V16, v2_code).is_err());
    }

    #[test]
    fn test_oversized_frame() {
        let codec = FrameCodec::new(OcppVersion::V16).with_max_frame_size(16);
        let raw = Bytes::from_static(br#"[2,"1","Heartbeat",{}]"#);
        assert_eq!(
            codec.decode(raw.clone()),
            Err(FrameError::TooLarge {
                size: raw.len(),
                limit: 16
            })
        );
        assert!(matches!(codec.encode(&raw), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let codec = FrameCodec::new(OcppVersion::V16);
        assert!(matches!(
            codec.decode(Bytes::from_static(&[0x5b, 0xff, 0x5d])),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(codec.encode(&[0xff]), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_encode_relays_opaque_payload() {
        let codec = FrameCodec::new(OcppVersion::V16);
        assert_eq!(codec.encode(br#"{"x":1}"#).unwrap(), r#"{"x":1}"#);
        assert!(codec.sniff(r#"{"x":1}"#).is_none());
        assert_eq!(
            codec.sniff(r#"[2,"9","Reset",{"type":"Soft"}]"#),
            Some(Envelope::Call {
                unique_id: "9".to_string(),
                action: "Reset".to_string()
            })
        );
    }
}
