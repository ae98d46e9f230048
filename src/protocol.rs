//! Wire protocol between client and server.
//!
//! Text frames carry JSON control messages tagged by a `type` field.
//! Binary frames carry raw little-endian int16 PCM with no framing header.
//! `utterance_audio` and `tts_audio` are pairs: the JSON meta frame is
//! immediately followed by one binary frame carrying the samples.

use serde::{Deserialize, Serialize};

/// Pipeline progress stages reported via `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SttStart,
    SttComplete,
    LlmStart,
    LlmComplete,
    TtsStart,
}

/// Messages sent from the edge client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Wake {
        score: f64,
    },
    /// Meta frame; the next binary frame carries `samples` int16 values.
    UtteranceAudio {
        sample_rate: u32,
        samples: usize,
    },
    BargeIn,
    FollowUpTimeout,
}

/// Messages sent from the server to the edge client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    WarmupAck,
    Status {
        stage: Stage,
    },
    SttRejected {
        reason: String,
    },
    /// Meta frame; the next binary frame carries `samples` int16 values.
    TtsAudio {
        sample_rate: u32,
        samples: usize,
        chunk_index: u64,
        is_last: bool,
    },
    TtsDone {
        cancelled: bool,
    },
    SessionCleared,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// Decode failures for incoming frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary audio frame has odd length {0}")]
    OddAudioPayload(usize),
}

/// Encode a control message as a compact JSON text frame.
pub fn encode_json<T: Serialize>(msg: &T) -> String {
    // Both message enums serialize infallibly (no maps with non-string keys).
    serde_json::to_string(msg).expect("wire message serialization")
}

/// Decode a client -> server text frame.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a server -> client text frame.
pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode int16 samples as raw little-endian PCM bytes.
pub fn encode_audio(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Decode raw little-endian PCM bytes into int16 samples.
pub fn decode_audio(bytes: &[u8]) -> Result<Vec<i16>, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::OddAudioPayload(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_round_trip() {
        let msgs = [
            ClientMessage::Wake { score: 0.93 },
            ClientMessage::UtteranceAudio {
                sample_rate: 16_000,
                samples: 4_096,
            },
            ClientMessage::BargeIn,
            ClientMessage::FollowUpTimeout,
        ];
        for msg in msgs {
            let text = encode_json(&msg);
            assert_eq!(decode_client(&text).unwrap(), msg);
        }
    }

    #[test]
    fn server_messages_round_trip() {
        let msgs = [
            ServerMessage::WarmupAck,
            ServerMessage::Status {
                stage: Stage::SttStart,
            },
            ServerMessage::SttRejected {
                reason: "empty_transcript".to_string(),
            },
            ServerMessage::TtsAudio {
                sample_rate: 24_000,
                samples: 3,
                chunk_index: 1,
                is_last: true,
            },
            ServerMessage::TtsDone { cancelled: false },
            ServerMessage::SessionCleared,
            ServerMessage::Error {
                message: "internal error".to_string(),
                stage: Some("protocol".to_string()),
                code: Some("protocol_missing_binary".to_string()),
            },
        ];
        for msg in msgs {
            let text = encode_json(&msg);
            assert_eq!(decode_server(&text).unwrap(), msg);
        }
    }

    #[test]
    fn type_tags_use_snake_case() {
        let text = encode_json(&ClientMessage::FollowUpTimeout);
        assert_eq!(text, r#"{"type":"follow_up_timeout"}"#);
        let text = encode_json(&ServerMessage::Status {
            stage: Stage::LlmComplete,
        });
        assert!(text.contains(r#""stage":"llm_complete""#));
    }

    #[test]
    fn error_optional_fields_are_omitted() {
        let text = encode_json(&ServerMessage::Error {
            message: "boom".to_string(),
            stage: None,
            code: None,
        });
        assert!(!text.contains("stage"));
        assert!(!text.contains("code"));
    }

    #[test]
    fn audio_round_trips() {
        let samples: Vec<i16> = vec![0, 1, -1, i16::MAX, i16::MIN, 12_345];
        let bytes = encode_audio(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(decode_audio(&bytes).unwrap(), samples);
    }

    #[test]
    fn audio_little_endian_layout() {
        // [1, 0, 2, 0, 3, 0] must decode to [1, 2, 3].
        let bytes = [1u8, 0, 2, 0, 3, 0];
        assert_eq!(decode_audio(&bytes).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn odd_audio_payload_is_rejected() {
        assert!(matches!(
            decode_audio(&[1, 2, 3]),
            Err(ProtocolError::OddAudioPayload(3))
        ));
    }
}
