use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::room::{ParticipantId, RoomToken};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} message requires a payload")]
    MissingPayload { kind: &'static str },
    #[error("{kind} message must not carry a payload")]
    UnexpectedPayload { kind: &'static str },
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
    #[error("invalid room id: {0}")]
    Room(#[from] crate::room::RoomError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Verbatim SDP description as exchanged between browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its JSON (`RTCIceCandidateInit`) shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Empty candidate lines mark the end of gathering.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    Join,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Hangup,
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Offer(_) => "offer",
            SignalKind::Answer(_) => "answer",
            SignalKind::Candidate(_) => "candidate",
            SignalKind::Hangup => "hangup",
        }
    }
}

/// One negotiation message on the room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "OutgoingMessage")]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub sender: ParticipantId,
    pub room: RoomToken,
}

impl SignalingMessage {
    pub fn new(kind: SignalKind, sender: ParticipantId, room: RoomToken) -> Self {
        Self { kind, sender, room }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;
        Self::try_from(wire)
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} in {}", self.kind.name(), self.sender, self.room)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireKind {
    Join,
    Offer,
    Answer,
    Candidate,
    Hangup,
}

/// Inbound shape; the payload is decoded once the type is known.
#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: WireKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    sender: String,
    #[serde(rename = "roomId")]
    room_id: String,
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: Option<Value>,
) -> Result<T, ProtocolError> {
    let value = payload.ok_or(ProtocolError::MissingPayload { kind })?;
    serde_json::from_value(value).map_err(|err| ProtocolError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}

fn expect_empty(kind: &'static str, payload: &Option<Value>) -> Result<(), ProtocolError> {
    match payload {
        None | Some(Value::Null) => Ok(()),
        Some(_) => Err(ProtocolError::UnexpectedPayload { kind }),
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = match wire.kind {
            WireKind::Join => {
                expect_empty("join", &wire.payload)?;
                SignalKind::Join
            }
            WireKind::Hangup => {
                expect_empty("hangup", &wire.payload)?;
                SignalKind::Hangup
            }
            WireKind::Offer => {
                let desc: SessionDescription = decode_payload("offer", wire.payload)?;
                if desc.kind != SdpKind::Offer {
                    return Err(ProtocolError::InvalidPayload {
                        kind: "offer",
                        reason: "description type is not offer".into(),
                    });
                }
                SignalKind::Offer(desc)
            }
            WireKind::Answer => {
                let desc: SessionDescription = decode_payload("answer", wire.payload)?;
                if desc.kind != SdpKind::Answer {
                    return Err(ProtocolError::InvalidPayload {
                        kind: "answer",
                        reason: "description type is not answer".into(),
                    });
                }
                SignalKind::Answer(desc)
            }
            WireKind::Candidate => SignalKind::Candidate(decode_payload("candidate", wire.payload)?),
        };
        Ok(Self {
            kind,
            sender: ParticipantId::new(wire.sender),
            room: RoomToken::from_wire(&wire.room_id)?,
        })
    }
}

/// Outbound shape; payloads stay typed so encoding cannot lose them.
#[derive(Debug, Clone, Serialize)]
struct OutgoingMessage {
    #[serde(rename = "type")]
    kind: WireKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<OutgoingPayload>,
    sender: String,
    #[serde(rename = "roomId")]
    room_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum OutgoingPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl From<SignalingMessage> for OutgoingMessage {
    fn from(message: SignalingMessage) -> Self {
        let (kind, payload) = match message.kind {
            SignalKind::Join => (WireKind::Join, None),
            SignalKind::Hangup => (WireKind::Hangup, None),
            SignalKind::Offer(desc) => (WireKind::Offer, Some(OutgoingPayload::Description(desc))),
            SignalKind::Answer(desc) => (WireKind::Answer, Some(OutgoingPayload::Description(desc))),
            SignalKind::Candidate(candidate) => {
                (WireKind::Candidate, Some(OutgoingPayload::Candidate(candidate)))
            }
        };
        OutgoingMessage {
            kind,
            payload,
            sender: message.sender.as_str().to_string(),
            room_id: message.room.as_str().to_string(),
        }
    }
}
