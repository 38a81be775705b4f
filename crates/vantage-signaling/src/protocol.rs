use serde::{Deserialize, Serialize};

/// JSON envelope exchanged on the signaling websocket.
///
/// The server sends `offer` and `candidate`; the client answers with
/// `answer` and its own `candidate`s. Connect/disconnect lifecycle is carried
/// by the websocket itself, not by the envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        mline_index: u32,
        candidate: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let messages = [
            Envelope::Offer {
                sdp: "v=0...".to_string(),
            },
            Envelope::Answer {
                sdp: "v=0...".to_string(),
            },
            Envelope::Candidate {
                mline_index: 0,
                candidate: "candidate:1 1 UDP 2013266431 192.0.2.1 40000 typ host".to_string(),
            },
        ];
        for msg in messages {
            let text = serde_json::to_string(&msg).unwrap();
            let back: Envelope = serde_json::from_str(&text).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[test]
    fn envelope_is_tagged_by_type() {
        let text = serde_json::to_string(&Envelope::Offer {
            sdp: "x".to_string(),
        })
        .unwrap();
        assert!(text.contains("\"type\":\"offer\""));
    }
}
