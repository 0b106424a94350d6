use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::error::{NvrError, ParseErrorKind, Result};
use crate::protocol::codec;
use crate::protocol::header::Headers;

/// Protocol token written on every outgoing request.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Base used to resolve path-only request targets (`/front`, `*`).
const RELATIVE_BASE: &str = "rtsp://localhost/";

/// A parsed RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// `uri` is the request target exactly as received and is what
/// [`write_to`](Self::write_to) emits; `url` is its parsed form. Use
/// [`set_url`](Self::set_url) to change the target so both stay in sync.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI as it appeared on the request line.
    pub uri: String,
    /// Parsed request target.
    pub url: Url,
    /// Protocol token from the request line (not validated).
    pub version: String,
    pub headers: Headers,
    /// Body of exactly `Content-Length` bytes.
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Build a request with no headers and no body.
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            method: method.to_string(),
            uri: url.to_string(),
            url,
            version: RTSP_VERSION.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Read the next request from `reader`.
    ///
    /// Returns [`NvrError::EndOfStream`] if the peer closed cleanly before
    /// sending any byte of a new request.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = codec::read_start_line(reader).await?;
        let (method, uri, version) = split_request_line(&line)?;
        let url = parse_request_uri(uri)?;
        let headers = codec::read_headers(reader).await?;
        let body = codec::read_body(reader, &headers).await?;

        Ok(RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            url,
            version: version.to_string(),
            headers,
            body,
        })
    }

    /// Look up a header value by name (case-insensitive, RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the CSeq header value (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Replace the request target.
    pub fn set_url(&mut self, url: Url) {
        self.uri = url.to_string();
        self.url = url;
    }

    /// Serialize to the RTSP wire format.
    ///
    /// The protocol token is always [`RTSP_VERSION`]. Known header names are
    /// written in canonical case. A body without a declared length gets a
    /// `Content-Length` header.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.uri, RTSP_VERSION).as_bytes(),
        );
        self.headers.write_to(&mut out);
        if !self.body.is_empty() && !self.headers.contains("Content-Length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Write the serialized request and flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Split `Method SP Request-URI SP Version` on the first two single spaces.
fn split_request_line(line: &str) -> Result<(&str, &str, &str)> {
    let malformed = || NvrError::parse(ParseErrorKind::InvalidRequestLine);
    let (method, rest) = line.split_once(' ').ok_or_else(malformed)?;
    let (uri, version) = rest.split_once(' ').ok_or_else(malformed)?;
    if method.is_empty() || uri.is_empty() {
        return Err(malformed());
    }
    Ok((method, uri, version))
}

/// Parse a request target: absolute URL, absolute path, or `*`.
fn parse_request_uri(uri: &str) -> Result<Url> {
    let invalid = || NvrError::parse(ParseErrorKind::InvalidUri(uri.to_string()));
    if uri.starts_with('/') || uri == "*" {
        let base = Url::parse(RELATIVE_BASE)?;
        return base.join(uri).map_err(|_| invalid());
    }
    Url::parse(uri).map_err(|_| invalid())
}

/// Value of a `Basic` Authorization header for the given credentials.
pub fn basic_auth(username: &str, password: &str) -> String {
    use base64::prelude::{BASE64_STANDARD, Engine as _};
    format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{username}:{password}"))
    )
}
