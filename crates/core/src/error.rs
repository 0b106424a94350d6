//! Error types for the NVR core.

use std::fmt;

/// Errors that can occur anywhere in the recorder.
///
/// Variants fall into four classes (see [`ErrorClass`]):
///
/// - **Protocol**: [`Parse`](Self::Parse), [`EndOfStream`](Self::EndOfStream),
///   [`UnexpectedEndOfStream`](Self::UnexpectedEndOfStream): malformed or
///   truncated RTSP messages. Fatal to the connection that produced them.
/// - **Connectivity**: [`Io`](Self::Io), [`Rtsp`](Self::Rtsp),
///   [`WebRtc`](Self::WebRtc), [`StreamUnusable`](Self::StreamUnusable),
///   [`NoDestination`](Self::NoDestination).
/// - **Resource**: [`TranscoderDisabled`](Self::TranscoderDisabled),
///   [`PipeUnavailable`](Self::PipeUnavailable).
/// - **Policy**: [`CameraNotFound`](Self::CameraNotFound), returned both for
///   unknown ids and for addresses the access list rejects.
#[derive(Debug, thiserror::Error)]
pub enum NvrError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed RTSP message.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The peer closed the stream cleanly between two messages.
    #[error("end of stream")]
    EndOfStream,

    /// The peer closed the stream in the middle of a message.
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,

    /// Unknown camera id, or a caller the camera's access list rejects.
    #[error("camera not found: {0}")]
    CameraNotFound(String),

    /// Camera URL in the configuration could not be used.
    #[error("invalid camera url {url}: {reason}")]
    InvalidCameraUrl { url: String, reason: String },

    /// A proxied request arrived before OPTIONS/DESCRIBE picked a camera.
    #[error("no destination camera for request")]
    NoDestination,

    /// The camera does not offer H.264 video as its first stream.
    #[error("stream not usable: {0}")]
    StreamUnusable(String),

    /// No transcoder command is configured.
    #[error("transcoder disabled")]
    TranscoderDisabled,

    /// A subprocess was spawned without the requested stdio pipe.
    #[error("transcoder {0} pipe unavailable")]
    PipeUnavailable(&'static str),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Camera-facing RTSP client failure.
    #[error("RTSP client error: {0}")]
    Rtsp(#[from] retina::Error),

    /// WebRTC stack failure.
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Request line did not have the `Method SP URI SP Version` shape.
    InvalidRequestLine,
    /// Response status line had no space after the version.
    InvalidStatusLine,
    /// Status code was not exactly three digits.
    InvalidStatusCode(String),
    /// Request target was neither an absolute URL, an absolute path, nor `*`.
    InvalidUri(String),
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a non-negative integer within limits.
    InvalidContentLength(String),
    /// A start line or header line was not valid UTF-8.
    InvalidEncoding,
    /// A start line or header line exceeded the line length limit.
    LineTooLong,
    /// The header block had more lines than allowed.
    TooManyHeaders,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "malformed request line"),
            Self::InvalidStatusLine => write!(f, "malformed status line"),
            Self::InvalidStatusCode(code) => write!(f, "malformed status code: {code}"),
            Self::InvalidUri(uri) => write!(f, "malformed request uri: {uri}"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength(value) => write!(f, "malformed content-length: {value}"),
            Self::InvalidEncoding => write!(f, "non UTF-8 message head"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::TooManyHeaders => write!(f, "too many header lines"),
        }
    }
}

/// Coarse error taxonomy used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed wire data; the connection that produced it is closed.
    Protocol,
    /// Dial/read/write failure; triggers cooldown-and-retry.
    Connectivity,
    /// Filesystem or subprocess allocation failure; the feature is skipped.
    Resource,
    /// Access list rejection, reported as "not found".
    PolicyDenied,
}

impl NvrError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        NvrError::Parse { kind }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Parse { .. } | Self::EndOfStream | Self::UnexpectedEndOfStream => {
                ErrorClass::Protocol
            }
            Self::CameraNotFound(_) => ErrorClass::PolicyDenied,
            Self::TranscoderDisabled | Self::PipeUnavailable(_) | Self::Config(_) => {
                ErrorClass::Resource
            }
            Self::Io(_)
            | Self::InvalidCameraUrl { .. }
            | Self::NoDestination
            | Self::StreamUnusable(_)
            | Self::Rtsp(_)
            | Self::WebRtc(_)
            | Self::Json(_)
            | Self::Url(_) => ErrorClass::Connectivity,
        }
    }
}

/// Convenience alias for `Result<T, NvrError>`.
pub type Result<T> = std::result::Result<T, NvrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_protocol_errors() {
        assert_eq!(NvrError::EndOfStream.class(), ErrorClass::Protocol);
        assert_eq!(
            NvrError::parse(ParseErrorKind::InvalidHeader).class(),
            ErrorClass::Protocol
        );
    }

    #[test]
    fn not_found_is_policy() {
        let e = NvrError::CameraNotFound("front".into());
        assert_eq!(e.class(), ErrorClass::PolicyDenied);
        assert_eq!(e.to_string(), "camera not found: front");
    }
}
