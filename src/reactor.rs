//! The reactor: a single-threaded readiness-based event loop multiplexing
//! listening sockets, client sockets, and CGI output pipes. Owns the
//! poll registry, the client session table, and the fd→owning-client
//! CGI pipe map.
//!
//! Each tick: listeners first, draining accepts until "would block";
//! then CGI pipes ahead of plain client fds; readable before writable so
//! a session the read path just closed is never also written to; a full
//! sweep of closed sessions after the event snapshot. Sessions are held
//! directly, keyed by fd/token, with no session→reactor back-pointers.

use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::cgi;
use crate::config::{self, AppConfig, LocationConfig, ServerConfig, IDLE_TIMEOUT_SECS};
use crate::error::{Result, ServerError};
use crate::http::HttpResponse;
use crate::router::{self, RouteOutcome, RoutingError};
use crate::session::{CgiPipeMap, CgiState, ClientSession, RouteContext};

const READ_BUF_SIZE: usize = 4096;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// The only piece of shared state with the signal context — read once
/// per tick, written only by the signal handler.
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
}

struct ListenerEntry {
    listener: TcpListener,
    port: u16,
    candidate_servers: Vec<Arc<ServerConfig>>,
}

/// Owns every listening socket, every client session, the CGI pipe map,
/// and the poll registry. Nothing outside this type mutates any of them.
pub struct Server {
    poll: Poll,
    listeners: HashMap<Token, ListenerEntry>,
    sessions: HashMap<Token, ClientSession>,
    cgi_pipes: CgiPipeMap,
    /// CGI children whose output pipe hit EOF before `waitpid` reported
    /// them exited; retried on the idle sweep until reaped, so a slow
    /// child never produces a zombie.
    reaping: Vec<Child>,
    next_token: usize,
}

impl Server {
    /// Binds one non-blocking listener per unique `host:port`, grouping
    /// server blocks that share a port into that listener's candidate
    /// list regardless of which block's `host` produced the bind.
    pub fn new(config: AppConfig) -> Result<Server> {
        if config.servers.is_empty() {
            return Err(ServerError::EmptyConfig);
        }

        let poll = Poll::new()?;
        let server_arcs: Vec<Arc<ServerConfig>> =
            config.servers.iter().cloned().map(Arc::new).collect();

        let mut listeners = HashMap::new();
        let mut seen_addrs: HashSet<String> = HashSet::new();
        let mut next_token = 0usize;

        for server in &server_arcs {
            let addr_str = format!("{}:{}", server.bind_host(), server.listen);
            if !seen_addrs.insert(addr_str.clone()) {
                continue;
            }
            let addr: SocketAddr = addr_str.parse()?;
            let mut listener =
                TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
            set_reuseaddr(&listener);

            let token = Token(next_token);
            next_token += 1;
            poll.registry()
                .register(&mut listener, token, Interest::READABLE)?;

            let candidate_servers: Vec<Arc<ServerConfig>> = server_arcs
                .iter()
                .filter(|s| s.listen == server.listen)
                .cloned()
                .collect();

            weblog::info!(%addr, port = server.listen, "listening");

            listeners.insert(
                token,
                ListenerEntry {
                    listener,
                    port: server.listen,
                    candidate_servers,
                },
            );
        }

        Ok(Server {
            poll,
            listeners,
            sessions: HashMap::new(),
            cgi_pipes: HashMap::new(),
            reaping: Vec::new(),
            next_token,
        })
    }

    /// Drives the event loop until the process-wide running flag clears.
    pub fn run(&mut self) -> Result<()> {
        install_signal_handlers();
        let mut events = Events::with_capacity(1024);

        while RUNNING.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll(e));
            }

            // Snapshot readiness bits up front: the accept/read/write
            // paths below mutate `self`, which `events` borrows from
            // `self.poll` would otherwise conflict with.
            let snapshot: Vec<(Token, bool, bool, bool)> = events
                .iter()
                .map(|e| {
                    (
                        e.token(),
                        e.is_readable(),
                        e.is_writable(),
                        e.is_error() || e.is_read_closed(),
                    )
                })
                .collect();

            for &(token, ..) in &snapshot {
                if self.listeners.contains_key(&token) {
                    self.accept_connections(token);
                }
            }

            for &(token, readable, writable, errored) in &snapshot {
                if self.listeners.contains_key(&token) {
                    continue;
                }
                if self.cgi_pipes.contains_key(&token) {
                    if readable || errored {
                        self.handle_cgi_pipe_event(token);
                    }
                    continue;
                }
                if !self.sessions.contains_key(&token) {
                    continue;
                }
                if errored {
                    if let Some(session) = self.sessions.get_mut(&token) {
                        session.closed = true;
                    }
                    continue;
                }
                if readable {
                    self.handle_readable(token);
                }
                if writable && self.sessions.get(&token).is_some_and(|s| !s.closed) {
                    self.handle_writable(token);
                }
            }

            self.sweep_idle_timeouts();
            self.reap_stray_children();
            self.sweep_closed_sessions();
        }
        Ok(())
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Accepts in a loop until the listener reports "would block".
    fn accept_connections(&mut self, listener_token: Token) {
        loop {
            let accept_result = match self.listeners.get(&listener_token) {
                Some(entry) => entry.listener.accept(),
                None => return,
            };
            match accept_result {
                Ok((mut stream, addr)) => {
                    let entry = self.listeners.get(&listener_token).unwrap();
                    let candidate_servers = entry.candidate_servers.clone();
                    let port = entry.port;
                    let token = self.allocate_token();
                    if self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .is_err()
                    {
                        continue;
                    }
                    weblog::debug!(%addr, port, "accepted connection");
                    self.sessions
                        .insert(token, ClientSession::new(token, stream, addr, candidate_servers));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    weblog::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let mut mark_closed = false;
        let mut got_bytes = false;
        {
            let Some(session) = self.sessions.get_mut(&token) else {
                return;
            };
            let mut buf = [0u8; READ_BUF_SIZE];
            match session.stream.read(&mut buf) {
                Ok(0) => mark_closed = true,
                Ok(n) => {
                    session.touch();
                    session.parser.ingest(&buf[..n]);
                    got_bytes = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => mark_closed = true,
            }
        }

        if mark_closed {
            if let Some(session) = self.sessions.get_mut(&token) {
                session.closed = true;
            }
            return;
        }
        if got_bytes {
            self.advance_parsing(token);
        }
    }

    /// Drives the parser as far as the input buffer allows. The body
    /// phase can't begin until a body-size limit is known, which
    /// depends on the virtual host and location the request resolves to
    /// — so host/location are resolved here too, ahead of the full
    /// routing pass `process_request` performs once the body is done.
    fn advance_parsing(&mut self, token: Token) {
        let mut need_more = false;
        let mut request_ready = false;
        let mut chunk_error = false;
        {
            let Some(session) = self.sessions.get_mut(&token) else {
                return;
            };
            if session.closed {
                return;
            }

            if !session.body_phase_started {
                if !session.parser.advance_headers() {
                    need_more = true;
                } else if session.parser.is_complete() {
                    session.body_phase_started = true;
                } else {
                    let host = session.parser.headers.get("host").cloned();
                    let server =
                        router::select_server(&session.candidate_servers, host.as_deref()).clone();
                    let location = server.select_location(&session.parser.path).cloned();
                    let limit = config::effective_body_limit(&server, location.as_ref());
                    session.parser.begin_body(limit);
                    session.body_phase_started = true;
                }
            }

            if !need_more {
                match session.parser.advance_body() {
                    Ok(true) => {
                        session.request_complete = true;
                        request_ready = true;
                    }
                    Ok(false) => need_more = true,
                    Err(_) => chunk_error = true,
                }
            }
        }

        if chunk_error {
            self.respond_bad_request(token);
        } else if request_ready {
            self.process_request(token);
        }
    }

    fn respond_bad_request(&mut self, token: Token) {
        if let Some(session) = self.sessions.get_mut(&token) {
            session.keep_alive = false;
            session.request_complete = true;
        }
        let mut response = HttpResponse::new(400);
        router::apply_connection_header(&mut response, false);
        if let Some(session) = self.sessions.get_mut(&token) {
            session.enqueue_response(&response);
        }
        self.set_writable_interest(token);
    }

    /// Runs the full policy pipeline now that headers and body are both
    /// complete, then either enqueues a response or hands off to the
    /// CGI subsystem.
    fn process_request(&mut self, token: Token) {
        let Some(session) = self.sessions.get(&token) else {
            return;
        };
        let host = session.parser.headers.get("host").cloned();
        let candidate_servers = session.candidate_servers.clone();
        let keep_alive = session.parser.keep_alive;

        let server = router::select_server(&candidate_servers, host.as_deref()).clone();
        let server_port = server.listen;
        let location = server.select_location(&session.parser.path).cloned();

        let outcome = {
            let session = self.sessions.get(&token).unwrap();
            router::route(&session.parser, &server, server_port)
        };

        if let Some(session) = self.sessions.get_mut(&token) {
            session.keep_alive = keep_alive;
        }

        match outcome {
            Ok(RouteOutcome::Cgi(cgi_request)) => {
                self.start_cgi(token, cgi_request, server, location);
            }
            Ok(RouteOutcome::Response(response)) => {
                self.finish_with_response(token, response, &server, location.as_ref());
            }
            Err(RoutingError::NoLocationMatch) => {
                self.finish_with_error(token, 404, &server, location.as_ref());
            }
        }
    }

    /// Applies the custom-error-page lookup and `Connection` header to
    /// an already-built response, enqueues it, and flips write interest
    /// on — the common tail of every response path (static, CGI
    /// failure, and routing failure alike).
    fn finish_with_response(
        &mut self,
        token: Token,
        mut response: HttpResponse,
        server: &ServerConfig,
        location: Option<&LocationConfig>,
    ) {
        router::apply_error_page(&mut response, server, location);
        let keep_alive = self.sessions.get(&token).map(|s| s.keep_alive).unwrap_or(false);
        router::apply_connection_header(&mut response, keep_alive);
        if let Some(session) = self.sessions.get_mut(&token) {
            session.enqueue_response(&response);
        }
        self.set_writable_interest(token);
    }

    fn finish_with_error(
        &mut self,
        token: Token,
        status: u16,
        server: &ServerConfig,
        location: Option<&LocationConfig>,
    ) {
        self.finish_with_response(token, HttpResponse::new(status), server, location);
    }

    /// Forks the interpreter and, on success, registers its stdout pipe
    /// with the poll registry — control returns to the reactor
    /// immediately, never blocking on the child.
    fn start_cgi(
        &mut self,
        token: Token,
        request: cgi::CgiRequest,
        server: Arc<ServerConfig>,
        location: Option<LocationConfig>,
    ) {
        match cgi::spawn(&request) {
            Ok(process) => {
                let raw_fd = process.out_file.as_raw_fd();
                let pipe_token = self.allocate_token();
                if self
                    .poll
                    .registry()
                    .register(&mut SourceFd(&raw_fd), pipe_token, Interest::READABLE)
                    .is_err()
                {
                    self.finish_with_error(token, 500, &server, location.as_ref());
                    return;
                }
                self.cgi_pipes.insert(pipe_token, token);
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.route_context = Some(RouteContext { server, location });
                    session.cgi_pipe_token = Some(pipe_token);
                    session.cgi = CgiState::Running {
                        child: process.child,
                        out_file: process.out_file,
                        output: Vec::new(),
                        started: Instant::now(),
                    };
                }
            }
            Err(cgi::CgiError::InterpreterMissing(interp)) => {
                weblog::warn!(interpreter = %interp, "cgi interpreter missing");
                self.finish_with_error(token, 404, &server, location.as_ref());
            }
            Err(e) => {
                weblog::error!(error = %e, "cgi spawn failed");
                self.finish_with_error(token, 500, &server, location.as_ref());
            }
        }
    }

    /// Reads everything currently available on a CGI pipe; on EOF hands
    /// off to `finish_cgi` to reap the child and parse the accumulated
    /// output into a response.
    fn handle_cgi_pipe_event(&mut self, pipe_token: Token) {
        let Some(&client_token) = self.cgi_pipes.get(&pipe_token) else {
            return;
        };
        let mut eof_or_err = false;
        {
            let Some(session) = self.sessions.get_mut(&client_token) else {
                return;
            };
            if let CgiState::Running { out_file, output, .. } = &mut session.cgi {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match out_file.read(&mut buf) {
                        Ok(0) => {
                            eof_or_err = true;
                            break;
                        }
                        Ok(n) => output.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(_) => {
                            eof_or_err = true;
                            break;
                        }
                    }
                }
            }
        }

        if eof_or_err {
            self.finish_cgi(client_token, pipe_token);
        }
    }

    fn finish_cgi(&mut self, client_token: Token, pipe_token: Token) {
        self.cgi_pipes.remove(&pipe_token);

        let mut parsed: Option<HttpResponse> = None;
        let mut route_context: Option<RouteContext> = None;
        let mut keep_alive = false;
        let mut stray_child: Option<Child> = None;

        {
            let Some(session) = self.sessions.get_mut(&client_token) else {
                return;
            };
            let Some(out_fd) = session.cgi.out_fd() else {
                return;
            };
            let _ = self.poll.registry().deregister(&mut SourceFd(&out_fd));

            if let CgiState::Running { mut child, out_file, output, .. } =
                std::mem::replace(&mut session.cgi, CgiState::Idle)
            {
                drop(out_file);
                if let Ok(None) = child.try_wait() {
                    stray_child = Some(child);
                }
                parsed = cgi::parse_output(&output);
            }

            session.cgi_pipe_token = None;
            route_context = session.route_context.take();
            keep_alive = session.keep_alive;
        }

        if let Some(child) = stray_child {
            self.reaping.push(child);
        }

        let response = parsed.unwrap_or_else(|| {
            weblog::warn!("cgi output was not parseable, responding 500");
            HttpResponse::new(500)
        });

        match route_context {
            Some(ctx) => self.finish_with_response(client_token, response, &ctx.server, ctx.location.as_ref()),
            None => {
                let mut response = response;
                router::apply_connection_header(&mut response, keep_alive);
                if let Some(session) = self.sessions.get_mut(&client_token) {
                    session.enqueue_response(&response);
                }
                self.set_writable_interest(client_token);
            }
        }
    }

    /// Drains as much of the write buffer as the socket accepts. On
    /// full drain, resets the session for the next request (keep-alive)
    /// or marks it closed. Any bytes already sitting in the input buffer
    /// (a second request arriving in the same `write` as the first) are
    /// parsed immediately rather than waiting for a read event that will
    /// never come.
    fn handle_writable(&mut self, token: Token) {
        let mut mark_closed = false;
        let mut drive_pipelined = false;
        {
            let Some(session) = self.sessions.get_mut(&token) else {
                return;
            };
            if !session.has_pending_write() {
                return;
            }
            let start = session.write_cursor;
            match session.stream.write(&session.write_buffer[start..]) {
                Ok(0) => mark_closed = true,
                Ok(n) => {
                    session.write_cursor += n;
                    session.touch();
                    if !session.has_pending_write() {
                        if session.keep_alive {
                            drive_pipelined = session.parser.has_trailing_bytes();
                            session.reset_for_next_request();
                        } else {
                            mark_closed = true;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => mark_closed = true,
            }
        }

        if mark_closed {
            if let Some(session) = self.sessions.get_mut(&token) {
                session.closed = true;
            }
            return;
        }

        self.set_writable_interest(token);
        if drive_pipelined {
            self.advance_parsing(token);
        }
    }

    fn set_writable_interest(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        let interest = if session.has_pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let _ = self
            .poll
            .registry()
            .reregister(&mut session.stream, token, interest);
    }

    /// Sessions with a complete-but-undrained response (or a CGI child
    /// still running) are exempt.
    fn sweep_idle_timeouts(&mut self) {
        let now = Instant::now();
        for session in self.sessions.values_mut() {
            if session.closed || session.awaiting_drain() {
                continue;
            }
            if now.duration_since(session.last_activity).as_secs() >= IDLE_TIMEOUT_SECS {
                session.closed = true;
            }
        }
    }

    fn reap_stray_children(&mut self) {
        self.reaping.retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
    }

    /// Destroys every session marked closed: deregisters and closes any
    /// CGI pipe it owns, deregisters and closes its client socket.
    /// Double-close is impossible here since each fd is owned by
    /// exactly one removed session.
    fn sweep_closed_sessions(&mut self) {
        let closed_tokens: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.closed)
            .map(|(t, _)| *t)
            .collect();

        for token in closed_tokens {
            let Some(mut session) = self.sessions.remove(&token) else {
                continue;
            };
            if let Some(pipe_token) = session.cgi_pipe_token.take() {
                self.cgi_pipes.remove(&pipe_token);
                if let CgiState::Running { mut child, out_file, .. } =
                    std::mem::replace(&mut session.cgi, CgiState::Idle)
                {
                    let raw_fd = out_file.as_raw_fd();
                    let _ = self.poll.registry().deregister(&mut SourceFd(&raw_fd));
                    drop(out_file);
                    if let Ok(None) = child.try_wait() {
                        self.reaping.push(child);
                    }
                }
            }
            let _ = self.poll.registry().deregister(&mut session.stream);
            weblog::debug!(peer = %session.peer_addr, "session closed");
        }
    }
}

#[cfg(unix)]
fn set_reuseaddr(listener: &TcpListener) {
    let fd = listener.as_raw_fd();
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn set_reuseaddr(_listener: &TcpListener) {}
