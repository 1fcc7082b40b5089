//! HTTP/1.1 message framing.
//!
//! [`RequestCodec`] sits on the client leg (decodes requests, encodes
//! responses) and [`ResponseCodec`] on the origin leg (encodes requests,
//! decodes responses). Both return `Ok(None)` until a whole message,
//! body included, is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DecodeError;
use crate::message::{Headers, HttpRequest, HttpResponse, Version};

/// Maximum number of header lines accepted in one message head.
pub const MAX_HEADERS: usize = 100;

/// Maximum size of a message head (start line plus headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Largest body buffered for one message, whatever its framing.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Longest chunk-size line tolerated before the stream is rejected.
const MAX_CHUNK_LINE: usize = 1024;

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
    UntilEof,
}

/// Client-leg codec: decodes [`HttpRequest`], encodes [`HttpResponse`].
#[derive(Debug)]
pub struct RequestCodec {
    pending: Option<(HttpRequest, BodyKind)>,
    last_method: Option<String>,
    max_body: usize,
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self {
            pending: None,
            last_method: None,
            max_body: MAX_BODY_BYTES,
        }
    }
}

impl RequestCodec {
    /// Creates a codec with no buffered state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps request bodies at `max_body` bytes instead of [`MAX_BODY_BYTES`].
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

impl Decoder for RequestCodec {
    type Item = HttpRequest;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpRequest>, DecodeError> {
        let (mut request, kind) = match self.pending.take() {
            Some(pending) => pending,
            None => match parse_request_head(src, self.max_body)? {
                Some((request, head_len, kind)) => {
                    src.advance(head_len);
                    (request, kind)
                }
                None => return Ok(None),
            },
        };

        match decode_body(kind, src, false, self.max_body)? {
            Some(body) => {
                request.body = body;
                self.last_method = Some(request.method.clone());
                Ok(Some(request))
            }
            None => {
                self.pending = Some((request, kind));
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HttpRequest>, DecodeError> {
        match self.decode(src)? {
            Some(request) => Ok(Some(request)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(truncated()),
        }
    }
}

impl Encoder<HttpResponse> for RequestCodec {
    type Error = DecodeError;

    fn encode(&mut self, mut response: HttpResponse, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let method = self.last_method.as_deref().unwrap_or("GET");
        let bodyless = method.eq_ignore_ascii_case("HEAD")
            || (method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&response.status))
            || (100..200).contains(&response.status)
            || response.status == 204
            || response.status == 304;

        if !bodyless {
            frame_length(&mut response.headers, &response.body);
        }

        dst.reserve(64 + response.reason.len() + response.body.len());
        dst.put_slice(response.version.as_str().as_bytes());
        dst.put_slice(format!(" {} ", response.status).as_bytes());
        dst.put_slice(response.reason.as_bytes());
        dst.put_slice(b"\r\n");
        write_headers(&response.headers, dst);

        if !bodyless {
            write_body(&response.headers, &response.body, dst);
        }
        Ok(())
    }
}

/// Origin-leg codec: encodes [`HttpRequest`], decodes [`HttpResponse`].
///
/// The method of the last encoded request decides whether the matching
/// response carries a body (HEAD, successful CONNECT).
#[derive(Debug)]
pub struct ResponseCodec {
    pending: Option<(HttpResponse, BodyKind)>,
    request_method: Option<String>,
    max_body: usize,
    head_seen: bool,
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self {
            pending: None,
            request_method: None,
            max_body: MAX_BODY_BYTES,
            head_seen: false,
        }
    }
}

impl ResponseCodec {
    /// Creates a codec with no buffered state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps response bodies at `max_body` bytes instead of [`MAX_BODY_BYTES`].
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// True once a response head arrived after the last encoded request.
    pub fn response_started(&self) -> bool {
        self.head_seen
    }

    fn body_kind(&self, response: &HttpResponse) -> Result<BodyKind, DecodeError> {
        let status = response.status;
        let method = self.request_method.as_deref().unwrap_or("GET");

        if (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(BodyKind::Empty);
        }
        if method.eq_ignore_ascii_case("HEAD") {
            return Ok(BodyKind::Empty);
        }
        if method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&status) {
            return Ok(BodyKind::Empty);
        }
        if response.headers.is_chunked() {
            return Ok(BodyKind::Chunked);
        }
        match content_length(&response.headers, self.max_body)? {
            Some(len) => Ok(BodyKind::Length(len)),
            None => Ok(BodyKind::UntilEof),
        }
    }
}

impl Decoder for ResponseCodec {
    type Item = HttpResponse;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpResponse>, DecodeError> {
        let (mut response, kind) = match self.pending.take() {
            Some(pending) => pending,
            None => match parse_response_head(src)? {
                Some((response, head_len)) => {
                    src.advance(head_len);
                    self.head_seen = true;
                    let kind = self.body_kind(&response)?;
                    (response, kind)
                }
                None => return Ok(None),
            },
        };

        match decode_body(kind, src, false, self.max_body)? {
            Some(body) => {
                response.body = body;
                // Interim responses precede the final one for the same request.
                if !(100..200).contains(&response.status) || response.status == 101 {
                    self.request_method = None;
                }
                Ok(Some(response))
            }
            None => {
                self.pending = Some((response, kind));
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HttpResponse>, DecodeError> {
        if let Some(response) = self.decode(src)? {
            return Ok(Some(response));
        }
        match self.pending.take() {
            Some((mut response, BodyKind::UntilEof)) => {
                response.body = decode_body(BodyKind::UntilEof, src, true, self.max_body)?.unwrap_or_default();
                self.request_method = None;
                Ok(Some(response))
            }
            None if src.is_empty() => Ok(None),
            _ => Err(truncated()),
        }
    }
}

impl Encoder<HttpRequest> for ResponseCodec {
    type Error = DecodeError;

    fn encode(&mut self, mut request: HttpRequest, dst: &mut BytesMut) -> Result<(), DecodeError> {
        if !request.body.is_empty() || request.headers.contains("content-length") {
            frame_length(&mut request.headers, &request.body);
        }

        dst.reserve(64 + request.target.len() + request.body.len());
        dst.put_slice(request.method.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(request.target.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(request.version.as_str().as_bytes());
        dst.put_slice(b"\r\n");
        write_headers(&request.headers, dst);
        write_body(&request.headers, &request.body, dst);

        self.request_method = Some(request.method);
        self.head_seen = false;
        Ok(())
    }
}

fn parse_request_head(
    src: &[u8],
    max_body: usize,
) -> Result<Option<(HttpRequest, usize, BodyKind)>, DecodeError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut raw_headers);

    let head_len = match parsed.parse(src) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return partial(src),
        Err(httparse::Error::TooManyHeaders) => return Err(DecodeError::HeadTooLarge),
        Err(e) => return Err(DecodeError::InvalidHead(e.to_string())),
    };
    if head_len > MAX_HEAD_BYTES {
        return Err(DecodeError::HeadTooLarge);
    }

    let method = parsed
        .method
        .ok_or_else(|| DecodeError::InvalidHead("missing method".into()))?;
    let target = parsed
        .path
        .ok_or_else(|| DecodeError::InvalidHead("missing request target".into()))?;
    let version = Version::from_minor(parsed.version.unwrap_or(1));
    let headers = collect_headers(parsed.headers);

    let kind = if headers.is_chunked() {
        BodyKind::Chunked
    } else {
        match content_length(&headers, max_body)? {
            Some(0) | None => BodyKind::Empty,
            Some(len) => BodyKind::Length(len),
        }
    };

    let request = HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body: Bytes::new(),
    };
    Ok(Some((request, head_len, kind)))
}

fn parse_response_head(src: &[u8]) -> Result<Option<(HttpResponse, usize)>, DecodeError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut raw_headers);

    let head_len = match parsed.parse(src) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return partial(src),
        Err(httparse::Error::TooManyHeaders) => return Err(DecodeError::HeadTooLarge),
        Err(e) => return Err(DecodeError::InvalidHead(e.to_string())),
    };
    if head_len > MAX_HEAD_BYTES {
        return Err(DecodeError::HeadTooLarge);
    }

    let status = parsed
        .code
        .ok_or_else(|| DecodeError::InvalidHead("missing status code".into()))?;
    let response = HttpResponse {
        version: Version::from_minor(parsed.version.unwrap_or(1)),
        status,
        reason: parsed.reason.unwrap_or_default().to_string(),
        headers: collect_headers(parsed.headers),
        body: Bytes::new(),
    };
    Ok(Some((response, head_len)))
}

fn partial<T>(src: &[u8]) -> Result<Option<T>, DecodeError> {
    if src.len() > MAX_HEAD_BYTES {
        Err(DecodeError::HeadTooLarge)
    } else {
        Ok(None)
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    raw.iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

/// Reads the declared body length, rejecting conflicts and lengths over
/// `max_body` before any of the body is buffered.
fn content_length(headers: &Headers, max_body: usize) -> Result<Option<usize>, DecodeError> {
    let mut length = None;
    for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(DecodeError::InvalidContentLength)
            }
            _ => length = Some(parsed),
        }
    }
    match length {
        Some(len) if len > max_body as u64 => Err(DecodeError::BodyTooLarge(len)),
        Some(len) => Ok(Some(len as usize)),
        None => Ok(None),
    }
}

fn decode_body(
    kind: BodyKind,
    src: &mut BytesMut,
    eof: bool,
    max_body: usize,
) -> Result<Option<Bytes>, DecodeError> {
    match kind {
        BodyKind::Empty => Ok(Some(Bytes::new())),
        BodyKind::Length(len) => {
            if src.len() < len {
                Ok(None)
            } else {
                Ok(Some(src.split_to(len).freeze()))
            }
        }
        BodyKind::Chunked => match parse_chunked(src, max_body)? {
            Some((body, consumed)) => {
                src.advance(consumed);
                Ok(Some(body))
            }
            None => Ok(None),
        },
        BodyKind::UntilEof => {
            if src.len() > max_body {
                Err(DecodeError::BodyTooLarge(src.len() as u64))
            } else if eof {
                Ok(Some(src.split().freeze()))
            } else {
                Ok(None)
            }
        }
    }
}

/// Parses a complete chunked body from the start of `src`.
///
/// Returns the de-chunked body and the number of bytes it occupied
/// (trailers included), or `None` when more bytes are needed.
fn parse_chunked(src: &[u8], max_body: usize) -> Result<Option<(Bytes, usize)>, DecodeError> {
    let mut pos = 0;
    let mut body = BytesMut::new();

    loop {
        let Some(line_len) = find_crlf(&src[pos..]) else {
            if src.len() - pos > MAX_CHUNK_LINE {
                return Err(DecodeError::InvalidChunk("chunk size line too long".into()));
            }
            return Ok(None);
        };
        let line = std::str::from_utf8(&src[pos..pos + line_len])
            .map_err(|_| DecodeError::InvalidChunk("non-ascii chunk size".into()))?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| DecodeError::InvalidChunk(format!("bad chunk size {size_text:?}")))?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(trailer_len) = find_crlf(&src[pos..]) else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body.freeze(), pos)));
                }
            }
        }

        let total = (body.len() as u64).saturating_add(size as u64);
        if total > max_body as u64 {
            return Err(DecodeError::BodyTooLarge(total));
        }
        let data_end = pos
            .checked_add(size)
            .ok_or_else(|| DecodeError::InvalidChunk("chunk size overflow".into()))?;
        let chunk_end = data_end
            .checked_add(2)
            .ok_or_else(|| DecodeError::InvalidChunk("chunk size overflow".into()))?;
        if src.len() < chunk_end {
            return Ok(None);
        }
        body.extend_from_slice(&src[pos..data_end]);
        if &src[data_end..chunk_end] != b"\r\n" {
            return Err(DecodeError::InvalidChunk("missing CRLF after chunk data".into()));
        }
        pos = chunk_end;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Makes `Content-Length` agree with the body unless the message is chunked.
fn frame_length(headers: &mut Headers, body: &Bytes) {
    if headers.is_chunked() {
        return;
    }
    if headers.get("content-length") != Some(body.len().to_string().as_str()) {
        headers.insert("Content-Length", body.len().to_string());
    }
}

fn write_headers(headers: &Headers, dst: &mut BytesMut) {
    let chunked = headers.is_chunked();
    for (name, value) in headers.iter() {
        if chunked && name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

fn write_body(headers: &Headers, body: &Bytes, dst: &mut BytesMut) {
    if headers.is_chunked() {
        if !body.is_empty() {
            dst.put_slice(format!("{:X}\r\n", body.len()).as_bytes());
            dst.put_slice(body);
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"0\r\n\r\n");
    } else {
        dst.put_slice(body);
    }
}

fn truncated() -> DecodeError {
    DecodeError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before message completed",
    ))
}
