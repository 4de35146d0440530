//! SDP offer/answer wrappers
//!
//! The peer connection produces and consumes the SDP itself. This module only
//! checks that text received over HTTP is structurally SDP before it reaches
//! the peer connection, and exposes the few fields worth logging.

use crate::{Error, Result};
use std::fmt;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// Media section summary (`m=` line plus its direction attribute)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    /// Media type from the m= line (audio, video, application)
    pub kind: String,
    /// sendonly / recvonly / sendrecv / inactive, if present
    pub direction: Option<String>,
}

/// A parsed session description
///
/// Keeps the original text untouched so it can be handed back to the peer
/// connection byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    sdp_type: SdpType,
    sdp: String,
    origin: String,
    session_name: String,
    media: Vec<MediaSection>,
}

/// SDP offer produced by the peer connection
pub type SdpOffer = SessionDescription;

/// SDP answer returned by the WHIP endpoint
pub type SdpAnswer = SessionDescription;

impl SessionDescription {
    /// Parse an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Result<Self> {
        Self::parse(SdpType::Offer, sdp.into())
    }

    /// Parse an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Result<Self> {
        Self::parse(SdpType::Answer, sdp.into())
    }

    fn parse(sdp_type: SdpType, sdp: String) -> Result<Self> {
        let mut lines = sdp.lines().filter(|line| !line.trim().is_empty());

        match lines.next() {
            Some("v=0") => {}
            Some(first) => {
                return Err(Error::SdpParse(format!(
                    "{} must start with v=0, got '{}'",
                    sdp_type, first
                )))
            }
            None => return Err(Error::SdpParse(format!("{} is empty", sdp_type))),
        }

        let mut origin = None;
        let mut session_name = None;
        let mut media: Vec<MediaSection> = Vec::new();

        for line in lines {
            let (key, value) = split_line(line).ok_or_else(|| {
                Error::SdpParse(format!("{} has malformed line '{}'", sdp_type, line))
            })?;

            match key {
                'o' if media.is_empty() => origin = Some(value.to_string()),
                's' if media.is_empty() => session_name = Some(value.to_string()),
                'm' => media.push(MediaSection {
                    kind: value.split(' ').next().unwrap_or_default().to_string(),
                    direction: None,
                }),
                'a' => {
                    if let Some(section) = media.last_mut() {
                        if matches!(value, "sendonly" | "recvonly" | "sendrecv" | "inactive") {
                            section.direction = Some(value.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        let origin =
            origin.ok_or_else(|| Error::SdpParse(format!("{} has no o= line", sdp_type)))?;

        Ok(Self {
            sdp_type,
            sdp,
            origin,
            session_name: session_name.unwrap_or_default(),
            media,
        })
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    /// SDP text as produced by the peer connection or returned by the server
    pub fn as_text(&self) -> &str {
        &self.sdp
    }

    pub fn into_text(self) -> String {
        self.sdp
    }

    /// Value of the o= line
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Value of the s= line
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn media(&self) -> &[MediaSection] {
        &self.media
    }
}

/// Split `<type>=<value>` where type is a single ASCII letter
fn split_line(line: &str) -> Option<(char, &str)> {
    let line = line.trim_end_matches('\r');
    let mut chars = line.chars();
    let key = chars.next().filter(|c| c.is_ascii_alphabetic())?;
    let rest = chars.as_str().strip_prefix('=')?;
    Some((key, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0 1\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:0\r\n\
        a=sendonly\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=mid:1\r\n\
        a=sendonly\r\n\
        a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn test_parse_offer() {
        let offer = SessionDescription::offer(OFFER).unwrap();
        assert_eq!(offer.sdp_type(), SdpType::Offer);
        assert_eq!(offer.origin(), "- 4215775240449105457 2 IN IP4 127.0.0.1");
        assert_eq!(offer.session_name(), "-");
        assert_eq!(offer.media().len(), 2);
        assert_eq!(offer.media()[0].kind, "audio");
        assert_eq!(offer.media()[1].direction.as_deref(), Some("sendonly"));
        assert_eq!(offer.as_text(), OFFER);
    }

    #[test]
    fn test_empty_answer_fails() {
        let err = SessionDescription::answer("").unwrap_err();
        assert!(matches!(err, Error::SdpParse(_)));
        assert!(SessionDescription::answer("\r\n\r\n").is_err());
    }

    #[test]
    fn test_non_sdp_body_fails() {
        assert!(SessionDescription::answer("<html>Not Found</html>").is_err());
        assert!(SessionDescription::answer("v=0\r\nthis is not sdp\r\n").is_err());
    }

    #[test]
    fn test_missing_origin_fails() {
        assert!(SessionDescription::answer("v=0\r\ns=-\r\nt=0 0\r\n").is_err());
    }

    #[test]
    fn test_lf_only_line_endings_accepted() {
        let answer = SessionDescription::answer("v=0\no=- 1 1 IN IP4 0.0.0.0\ns=-\nt=0 0\n").unwrap();
        assert_eq!(answer.sdp_type(), SdpType::Answer);
        assert!(answer.media().is_empty());
    }
}
