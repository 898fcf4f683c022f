use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Messages received from a browser client over its signaling WebSocket.
///
/// The wire format uses an `id` discriminator field, e.g.
/// `{"id":"start","sdpOffer":"v=0..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ClientMessage {
    /// Begin negotiation with an SDP offer.
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },
    /// Tear down the session and release backend resources.
    #[serde(rename = "stop")]
    Stop,
    /// An ICE candidate gathered by the browser.
    #[serde(rename = "onIceCandidate")]
    IceCandidate { candidate: IceCandidate },
}

/// Messages sent to a browser client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ServerMessage {
    /// The SDP answer produced by the media server for a `start`.
    #[serde(rename = "startResponse")]
    StartResponse {
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },
    /// An ICE candidate gathered by the media server endpoint.
    #[serde(rename = "iceCandidate")]
    IceCandidate { candidate: IceCandidate },
    /// A structured error. Does not imply the channel is closing.
    #[serde(rename = "error")]
    Error { message: String },
}

/// One connectivity candidate, relayed opaquely between the browser and the
/// media server. Fields beyond the three standard ones (for example
/// `usernameFragment` from newer browsers) are preserved in `extra` rather
/// than rejected or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            extra: Map::new(),
        }
    }
}

/// Extract the `id` discriminator of an inbound message without fully
/// parsing it. Used to name the offending kind when dispatch fails.
pub fn message_kind(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"id":"start","sdpOffer":"v=0\r\n..."}"#).unwrap();
        match msg {
            ClientMessage::Start { sdp_offer } => assert_eq!(sdp_offer, "v=0\r\n..."),
            _ => panic!("Expected Start"),
        }
    }

    #[test]
    fn stop_wire_format() {
        let msg: ClientMessage = serde_json::from_str(r#"{"id":"stop"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Stop));
    }

    #[test]
    fn client_candidate_wire_format() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{
                "id": "onIceCandidate",
                "candidate": {
                    "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }"#,
        )
        .unwrap();
        match msg {
            ClientMessage::IceCandidate { candidate } => {
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn start_response_serializes_with_id_tag() {
        let msg = ServerMessage::StartResponse {
            sdp_answer: "v=0\r\nanswer".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""id":"startResponse""#));
        assert!(json.contains(r#""sdpAnswer""#));
    }

    #[test]
    fn outbound_candidate_serializes_with_id_tag() {
        let msg = ServerMessage::IceCandidate {
            candidate: IceCandidate::new(
                "candidate:2 1 UDP 1694498815 198.51.100.7 40001 typ srflx",
            ),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""id":"iceCandidate""#));
        assert!(json.contains("typ srflx"));
        // Absent sdpMid / sdpMLineIndex must be omitted, not null
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("null"));
    }

    #[test]
    fn error_serializes_with_id_tag() {
        let msg = ServerMessage::Error {
            message: "Invalid message frobnicate".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""id":"error""#));
        assert!(json.contains("Invalid message frobnicate"));
    }

    #[test]
    fn candidate_preserves_unknown_fields() {
        let json = r#"{
            "candidate": "candidate:1 1 UDP 2130706431 10.0.0.1 9 typ host",
            "sdpMid": "audio",
            "sdpMLineIndex": 1,
            "usernameFragment": "abcd"
        }"#;
        let cand: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(
            cand.extra.get("usernameFragment").and_then(Value::as_str),
            Some("abcd")
        );

        // Round-trips back out to the media server unchanged
        let out = serde_json::to_string(&cand).unwrap();
        assert!(out.contains(r#""usernameFragment":"abcd""#));
    }

    #[test]
    fn unknown_id_fails_typed_parse_but_kind_is_recoverable() {
        let raw = r#"{"id":"frobnicate","payload":1}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
        assert_eq!(message_kind(raw).as_deref(), Some("frobnicate"));
    }

    #[test]
    fn message_kind_handles_garbage() {
        assert_eq!(message_kind("not json at all"), None);
        assert_eq!(message_kind(r#"{"noid":true}"#), None);
    }
}
