//! RTSP message codec (RFC 2326).
//!
//! Parses and serializes the text-based RTSP signaling messages exchanged by
//! the proxy with its clients and with cameras.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! - The start line fields are separated by single spaces.
//! - Header names are case-insensitive for lookup, but `CSeq` is written in
//!   its canonical spelling because some camera firmware rejects anything
//!   else ([`header::canonical_name`]).
//! - A body is present only when `Content-Length` says so.
//!
//! Reading distinguishes a clean close between messages
//! ([`EndOfStream`](crate::NvrError::EndOfStream)) from a close in the middle
//! of one ([`UnexpectedEndOfStream`](crate::NvrError::UnexpectedEndOfStream)).

pub mod codec;
pub mod header;
pub mod request;
pub mod response;

pub use header::Headers;
pub use request::{RtspRequest, basic_auth};
pub use response::RtspResponse;
