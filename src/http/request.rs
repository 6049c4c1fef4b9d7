//! Resumable HTTP/1.1 request parsing.
//!
//! `HttpRequestParser` is fed bytes as they arrive from the socket and
//! tracks its own progress across an arbitrary number of partial reads.
//! Header parsing and body parsing are split into two phases so the
//! caller can resolve the effective body-size limit (which depends on
//! the matched virtual host and location) before the body phase starts.

use std::collections::HashMap;
use std::fmt;

use super::method::Method;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid chunk framing")]
    InvalidChunkSize,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    ChunkedBody,
    Complete,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ChunkState {
    Size,
    Data(usize),
    TrailingCrlf,
    FinalCrlf,
}

/// A line that is not `method target version` with exactly three
/// whitespace-separated tokens, or an unrecognized method, just marks
/// the request malformed rather than erroring the connection outright;
/// the router turns that into a 400.
#[derive(Debug)]
pub struct HttpRequestParser {
    state: ParseState,
    chunk_state: ChunkState,
    buffer: Vec<u8>,
    cursor: usize,
    body_limit: usize,

    pub method: Method,
    pub path: String,
    pub query: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub keep_alive: bool,
    pub malformed: bool,
    pub too_large: bool,
    pub parsed_bytes: usize,
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestParser {
    pub fn new() -> Self {
        HttpRequestParser {
            state: ParseState::RequestLine,
            chunk_state: ChunkState::Size,
            buffer: Vec::with_capacity(4096),
            cursor: 0,
            body_limit: usize::MAX,
            method: Method::GET,
            path: String::new(),
            query: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: None,
            chunked: false,
            keep_alive: true,
            malformed: false,
            too_large: false,
            parsed_bytes: 0,
        }
    }

    /// Appends freshly-read socket bytes to the internal buffer.
    pub fn ingest(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn is_in_header_phase(&self) -> bool {
        matches!(self.state, ParseState::RequestLine | ParseState::Headers)
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Drives request-line and header parsing as far as buffered bytes
    /// allow. Returns `true` once the header block has been fully
    /// consumed (either normally, or because the request was found
    /// malformed and short-circuited straight to completion).
    pub fn advance_headers(&mut self) -> bool {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line_end) = find_crlf(&self.buffer, self.cursor) else {
                        return false;
                    };
                    let line = &self.buffer[self.cursor..line_end];
                    self.cursor = line_end + 2;

                    let Ok(line) = std::str::from_utf8(line) else {
                        self.malformed = true;
                        self.state = ParseState::Complete;
                        return true;
                    };
                    let tokens: Vec<&str> = line.split_whitespace().collect();
                    if tokens.len() != 3 {
                        self.malformed = true;
                        self.state = ParseState::Complete;
                        return true;
                    }
                    match tokens[0].parse::<Method>() {
                        Ok(m) => self.method = m,
                        Err(()) => {
                            self.malformed = true;
                            self.state = ParseState::Complete;
                            return true;
                        }
                    }
                    let (path, query) = match tokens[1].split_once('?') {
                        Some((p, q)) => (p, q),
                        None => (tokens[1], ""),
                    };
                    self.path = decode_percent(path, false);
                    self.query = decode_percent(query, true);
                    self.version = tokens[2].to_string();
                    self.keep_alive = self.version != "HTTP/1.0";
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line_end) = find_crlf(&self.buffer, self.cursor) else {
                        return false;
                    };
                    let line = &self.buffer[self.cursor..line_end];
                    self.cursor = line_end + 2;

                    if line.is_empty() {
                        self.finish_headers();
                        return true;
                    }

                    let Ok(line) = std::str::from_utf8(line) else {
                        self.malformed = true;
                        self.state = ParseState::Complete;
                        return true;
                    };
                    match line.split_once(':') {
                        Some((name, value)) => {
                            self.headers
                                .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                        }
                        None => {
                            self.malformed = true;
                            self.state = ParseState::Complete;
                            return true;
                        }
                    }
                }
                _ => return true,
            }
        }
    }

    fn finish_headers(&mut self) {
        self.content_length = self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok());
        self.chunked = self
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if let Some(conn) = self.headers.get("connection") {
            match conn.to_ascii_lowercase().as_str() {
                "close" => self.keep_alive = false,
                "keep-alive" => self.keep_alive = true,
                _ => {}
            }
        }

        if self.version == "HTTP/1.1" && !self.headers.contains_key("host") {
            self.malformed = true;
        }
    }

    /// Resolves the body phase once the effective body-size limit for
    /// the matched location is known. Must be called exactly once,
    /// right after `advance_headers` returns `true` with the parser
    /// not already `Complete`.
    pub fn begin_body(&mut self, body_limit: usize) {
        self.body_limit = body_limit;

        if self.malformed {
            self.state = ParseState::Complete;
            return;
        }

        if self.chunked {
            self.state = ParseState::ChunkedBody;
            return;
        }

        match self.content_length {
            Some(len) if len > body_limit => {
                self.too_large = true;
                self.state = ParseState::Complete;
            }
            Some(0) | None => {
                self.state = ParseState::Complete;
            }
            Some(_) => {
                self.state = ParseState::Body;
            }
        }
    }

    /// Drives body parsing as far as buffered bytes allow. Returns
    /// `Ok(true)` once the request (headers + body) is fully parsed.
    pub fn advance_body(&mut self) -> Result<bool, ParseError> {
        loop {
            match self.state {
                ParseState::Body => {
                    let needed = self.content_length.unwrap_or(0) - self.body.len();
                    let available = self.buffer.len() - self.cursor;
                    let take = available.min(needed);
                    if take > 0 {
                        self.body
                            .extend_from_slice(&self.buffer[self.cursor..self.cursor + take]);
                        self.cursor += take;
                    }
                    if self.body.len() == self.content_length.unwrap_or(0) {
                        self.state = ParseState::Complete;
                    } else {
                        return Ok(false);
                    }
                }
                ParseState::ChunkedBody => match self.advance_chunk()? {
                    true => {}
                    false => return Ok(false),
                },
                ParseState::Complete => return Ok(true),
                _ => return Ok(true),
            }
        }
    }

    fn advance_chunk(&mut self) -> Result<bool, ParseError> {
        match self.chunk_state {
            ChunkState::Size => {
                let Some(line_end) = find_crlf(&self.buffer, self.cursor) else {
                    if self.buffer.len() - self.cursor > 64 {
                        return Err(ParseError::InvalidChunkSize);
                    }
                    return Ok(false);
                };
                let line = std::str::from_utf8(&self.buffer[self.cursor..line_end])
                    .map_err(|_| ParseError::InvalidChunkSize)?;
                let hex = line.split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(hex, 16).map_err(|_| ParseError::InvalidChunkSize)?;
                self.cursor = line_end + 2;

                if self.body.len() + size > self.body_limit {
                    self.too_large = true;
                    self.state = ParseState::Complete;
                    return Ok(true);
                }

                self.chunk_state = if size == 0 {
                    ChunkState::FinalCrlf
                } else {
                    ChunkState::Data(size)
                };
                Ok(true)
            }
            ChunkState::Data(remaining) => {
                let available = self.buffer.len() - self.cursor;
                if available == 0 {
                    return Ok(false);
                }
                let take = available.min(remaining);
                self.body
                    .extend_from_slice(&self.buffer[self.cursor..self.cursor + take]);
                self.cursor += take;
                let left = remaining - take;
                self.chunk_state = if left == 0 {
                    ChunkState::TrailingCrlf
                } else {
                    ChunkState::Data(left)
                };
                Ok(left == 0)
            }
            ChunkState::TrailingCrlf => {
                if self.buffer.len() - self.cursor < 2 {
                    return Ok(false);
                }
                if &self.buffer[self.cursor..self.cursor + 2] != b"\r\n" {
                    return Err(ParseError::InvalidChunkSize);
                }
                self.cursor += 2;
                self.chunk_state = ChunkState::Size;
                Ok(true)
            }
            ChunkState::FinalCrlf => {
                if self.buffer.len() - self.cursor < 2 {
                    return Ok(false);
                }
                if &self.buffer[self.cursor..self.cursor + 2] != b"\r\n" {
                    return Err(ParseError::InvalidChunkSize);
                }
                self.cursor += 2;
                self.state = ParseState::Complete;
                Ok(true)
            }
        }
    }

    /// Bytes still sitting in the buffer past the current request —
    /// either more of this request if incomplete, or the start of a
    /// pipelined next request once this one is complete.
    pub fn has_trailing_bytes(&self) -> bool {
        self.is_complete() && self.buffer.len() > self.cursor
    }

    /// Drops the bytes belonging to the just-completed request and
    /// resets parsing state so the parser can be reused for the next
    /// request on a keep-alive connection.
    pub fn reset(&mut self) {
        self.parsed_bytes = self.cursor;
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        self.state = ParseState::RequestLine;
        self.chunk_state = ChunkState::Size;
        self.method = Method::GET;
        self.path.clear();
        self.query.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.content_length = None;
        self.chunked = false;
        self.keep_alive = true;
        self.malformed = false;
        self.too_large = false;
    }
}

fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    let haystack = buffer.get(from..)?;
    let mut pos = 0;
    while let Some(r) = haystack[pos..].iter().position(|&b| b == b'\r') {
        let at = pos + r;
        if haystack.get(at + 1) == Some(&b'\n') {
            return Some(from + at);
        }
        pos = at + 1;
    }
    None
}

pub fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn decode_percent(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2]) => {
                out.push(hex_val(bytes[i + 1]) * 16 + hex_val(bytes[i + 2]));
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

impl fmt::Display for HttpRequestParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.path, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(parser: &mut HttpRequestParser, limit: usize, data: &[u8]) -> bool {
        parser.ingest(data);
        if parser.advance_headers() && !parser.is_complete() {
            parser.begin_body(limit);
        }
        if !parser.is_in_header_phase() {
            parser.advance_body().unwrap()
        } else {
            false
        }
    }

    #[test]
    fn parses_simple_get() {
        let mut p = HttpRequestParser::new();
        let done = drive(&mut p, 1024, b"GET /a?x=1+2 HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(done);
        assert_eq!(p.path, "/a");
        assert_eq!(p.query, "x=1 2");
        assert!(!p.malformed);
    }

    #[test]
    fn one_byte_at_a_time() {
        let req = b"GET /index.html HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabc";
        let mut p = HttpRequestParser::new();
        let mut body_started = false;
        let mut done = false;
        for i in 0..req.len() {
            p.ingest(&req[i..i + 1]);
            if p.is_in_header_phase() {
                if p.advance_headers() && !p.is_complete() {
                    p.begin_body(1024);
                    body_started = true;
                }
            } else if body_started {
                done = p.advance_body().unwrap();
            }
            if done {
                break;
            }
        }
        assert!(done);
        assert_eq!(p.body, b"abc");
        assert_eq!(p.parsed_bytes, 0); // reset() not called yet
    }

    #[test]
    fn missing_host_under_11_is_malformed() {
        let mut p = HttpRequestParser::new();
        drive(&mut p, 1024, b"GET / HTTP/1.1\r\n\r\n");
        assert!(p.malformed);
    }

    #[test]
    fn chunked_body_split_across_reads() {
        let mut p = HttpRequestParser::new();
        p.ingest(b"POST /up HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(p.advance_headers());
        p.begin_body(1024);
        p.ingest(b"4\r\nWi");
        assert!(!p.advance_body().unwrap());
        p.ingest(b"ki\r\n0\r\n\r\n");
        assert!(p.advance_body().unwrap());
        assert_eq!(p.body, b"Wiki");
    }

    #[test]
    fn body_too_large_sets_flag() {
        let mut p = HttpRequestParser::new();
        p.ingest(b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\n");
        assert!(p.advance_headers());
        p.begin_body(10);
        assert!(p.too_large);
        assert!(p.is_complete());
    }
}
