//! Signaling envelope wire format
//!
//! Every negotiation message travels over the relay as
//! `{type, data, from, to}`. Receivers discard envelopes not addressed to
//! them, so the relay may fan them out to the whole session.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Trickled network candidate
    IceCandidate,
}

/// A directed negotiation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: SignalKind,

    /// Kind-specific payload
    pub data: serde_json::Value,

    /// Sender participant id
    pub from: String,

    /// Recipient participant id
    pub to: String,
}

/// Offer or answer marker inside a description payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description payload `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Opaque SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network candidate payload `{candidate, sdpMid, sdpMLineIndex}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate bound to the first media line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Basic structural check; empty candidate lines are rejected
    pub fn validate(&self) -> Result<()> {
        if self.candidate.trim().is_empty() {
            return Err(Error::IceCandidateError("empty candidate line".to_string()));
        }
        Ok(())
    }
}

impl Envelope {
    /// Build an offer envelope
    pub fn offer(from: &str, to: &str, description: &SessionDescription) -> Result<Self> {
        Self::build(SignalKind::Offer, from, to, description)
    }

    /// Build an answer envelope
    pub fn answer(from: &str, to: &str, description: &SessionDescription) -> Result<Self> {
        Self::build(SignalKind::Answer, from, to, description)
    }

    /// Build a candidate envelope
    pub fn candidate(from: &str, to: &str, candidate: &IceCandidate) -> Result<Self> {
        Self::build(SignalKind::IceCandidate, from, to, candidate)
    }

    fn build<T: Serialize>(kind: SignalKind, from: &str, to: &str, data: &T) -> Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(data)?,
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Parse an envelope from relay JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to relay JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload as a session description
    pub fn description(&self) -> Result<SessionDescription> {
        let description: SessionDescription = serde_json::from_value(self.data.clone())
            .map_err(|e| Error::SdpError(format!("malformed description: {}", e)))?;
        let expected = match self.kind {
            SignalKind::Offer => SdpType::Offer,
            SignalKind::Answer => SdpType::Answer,
            SignalKind::IceCandidate => {
                return Err(Error::SdpError(
                    "candidate envelope carries no description".to_string(),
                ))
            }
        };
        if description.sdp_type != expected {
            return Err(Error::SdpError(format!(
                "{:?} envelope carries {:?} description",
                self.kind, description.sdp_type
            )));
        }
        Ok(description)
    }

    /// Decode the payload as a network candidate
    pub fn ice_candidate(&self) -> Result<IceCandidate> {
        if self.kind != SignalKind::IceCandidate {
            return Err(Error::IceCandidateError(format!(
                "{:?} envelope carries no candidate",
                self.kind
            )));
        }
        let candidate: IceCandidate = serde_json::from_value(self.data.clone())
            .map_err(|e| Error::IceCandidateError(format!("malformed candidate: {}", e)))?;
        candidate.validate()?;
        Ok(candidate)
    }

    /// Whether this envelope is meant for `local_id` and was not sent by it
    pub fn is_for(&self, local_id: &str) -> bool {
        self.to == local_id && self.from != local_id
    }
}
