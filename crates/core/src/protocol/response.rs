use tokio::io::AsyncBufRead;

use crate::error::{NvrError, ParseErrorKind, Result};
use crate::protocol::codec;
use crate::protocol::header::Headers;
use crate::protocol::request::RTSP_VERSION;

/// An RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Parsed with [`read_from`](Self::read_from). Responses can also be built
/// with [`ok`](Self::ok)/[`add_header`](Self::add_header)/[`with_body`](Self::with_body)
/// and written with [`serialize`](Self::serialize).
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub version: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            version: RTSP_VERSION.to_string(),
            status_code,
            status_text: status_text.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// 200 OK (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 404 Not Found.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Read the next response from `reader`.
    ///
    /// The status line is `Version SP Code SP Reason`; the code must be
    /// exactly three digits.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = codec::read_start_line(reader).await?;
        let (version, status) = line
            .split_once(' ')
            .ok_or(NvrError::parse(ParseErrorKind::InvalidStatusLine))?;
        let status = status.trim_start_matches(' ');
        let (code, reason) = status.split_once(' ').unwrap_or((status, ""));
        let status_code = parse_status_code(code)?;

        let headers = codec::read_headers(reader).await?;
        let body = codec::read_body(reader, &headers).await?;

        Ok(RtspResponse {
            version: version.to_string(),
            status_code,
            status_text: reason.to_string(),
            headers,
            body,
        })
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Serialize to the RTSP wire format.
    ///
    /// If a body is present, `Content-Length` is appended unless already set
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.status_text
        )
        .into_bytes();
        self.headers.write_to(&mut out);
        if !self.body.is_empty() && !self.headers.contains("Content-Length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn parse_status_code(code: &str) -> Result<u16> {
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NvrError::parse(ParseErrorKind::InvalidStatusCode(
            code.to_string(),
        )));
    }
    code.parse()
        .map_err(|_| NvrError::parse(ParseErrorKind::InvalidStatusCode(code.to_string())))
}
