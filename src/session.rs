//! Per-connection state: input buffer/parser, output buffer, CGI
//! handle, and last-activity timestamp.

use std::collections::HashMap;
use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::process::Child;
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;

use crate::config::{LocationConfig, ServerConfig};
use crate::http::{HttpRequestParser, HttpResponse};

/// The server/location a request resolved to, kept on the session
/// across an asynchronous CGI round-trip so completion (or CGI failure)
/// can still apply the right custom error page and body-size policy
/// context once the child's output (or non-zero exit) is observed.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub server: Arc<ServerConfig>,
    pub location: Option<LocationConfig>,
}

/// The embedded CGI-state record: idle, or running (pipe fd + pid +
/// accumulated output). A "done" state has no variant of its own — the
/// reactor parses the accumulated output and drops straight back to
/// `Idle` in the same tick that observes EOF, so there's no window
/// where a session sits in a third state.
#[derive(Debug)]
pub enum CgiState {
    Idle,
    Running {
        child: Child,
        out_file: File,
        output: Vec<u8>,
        started: Instant,
    },
}

impl CgiState {
    pub fn out_fd(&self) -> Option<RawFd> {
        match self {
            CgiState::Running { out_file, .. } => Some(out_file.as_raw_fd()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, CgiState::Running { .. })
    }
}

pub struct ClientSession {
    pub token: Token,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,

    /// The growing input buffer lives inside `parser` (it owns the raw
    /// bytes and a consumption cursor); this session just feeds it
    /// fresh socket reads via `parser.ingest`.
    pub parser: HttpRequestParser,
    pub request_complete: bool,
    pub body_phase_started: bool,

    pub write_buffer: Vec<u8>,
    pub write_cursor: usize,

    pub last_activity: Instant,
    pub closed: bool,

    /// The candidate server configs sharing this listener's port, in
    /// declared order — virtual-host selection runs over exactly this
    /// list.
    pub candidate_servers: Vec<Arc<ServerConfig>>,

    pub cgi: CgiState,
    pub cgi_pipe_token: Option<Token>,
    pub route_context: Option<RouteContext>,
    pub keep_alive: bool,
}

impl ClientSession {
    pub fn new(
        token: Token,
        stream: TcpStream,
        peer_addr: SocketAddr,
        candidate_servers: Vec<Arc<ServerConfig>>,
    ) -> Self {
        ClientSession {
            token,
            stream,
            peer_addr,
            parser: HttpRequestParser::new(),
            request_complete: false,
            body_phase_started: false,
            write_buffer: Vec::new(),
            write_cursor: 0,
            last_activity: Instant::now(),
            closed: false,
            candidate_servers,
            cgi: CgiState::Idle,
            cgi_pipe_token: None,
            route_context: None,
            keep_alive: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn has_pending_write(&self) -> bool {
        self.write_cursor < self.write_buffer.len()
    }

    /// While the request is complete but the response has not yet
    /// drained, the session must not be swept for read-idle timeout.
    pub fn awaiting_drain(&self) -> bool {
        self.request_complete && (self.has_pending_write() || self.cgi.is_running())
    }

    pub fn enqueue_response(&mut self, response: &HttpResponse) {
        self.write_buffer.extend_from_slice(&response.to_bytes());
    }

    /// Resets buffers and parser for the next request on a keep-alive
    /// connection. Any bytes already sitting in the input buffer beyond
    /// the consumed request are preserved (pipelined bytes).
    pub fn reset_for_next_request(&mut self) {
        self.parser.reset();
        self.request_complete = false;
        self.body_phase_started = false;
        self.write_buffer.clear();
        self.write_cursor = 0;
        self.cgi = CgiState::Idle;
        self.cgi_pipe_token = None;
        self.route_context = None;
    }
}

/// Registry mapping a CGI output-pipe fd's poll token to the client
/// token that owns it — consulted first on every non-listener readiness
/// event.
pub type CgiPipeMap = HashMap<Token, Token>;
