//! Asynchronous CGI: fork/exec of interpreters communicating over
//! pipes, integrated into the reactor without blocking other clients.
//! Spawns via `std::process::Command` with piped stdio and converts the
//! child's stdout handle to a raw fd for polling, the standard-library
//! way to get a pollable fd out of a forked child without hand-rolling
//! `fork`/`execve` via `libc` directly.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::config::LocationConfig;
use crate::http::{find_subsequence, HttpRequestParser, HttpResponse};

/// Extension of a decoded request path (between the last `.` and the
/// end, ignoring any already-split-off query string), lower-cased.
pub fn extension_of(decoded_path: &str) -> Option<String> {
    let name = decoded_path.rsplit('/').next().unwrap_or(decoded_path);
    name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

pub fn is_cgi_eligible(decoded_path: &str, location: &LocationConfig) -> Option<String> {
    let ext = extension_of(decoded_path)?;
    location.is_cgi_ext(&format!(".{ext}")).then_some(ext)
}

pub fn interpreter_for(location: &LocationConfig, ext: &str) -> Option<String> {
    location
        .cgi_interpreter_for(&format!(".{ext}"))
        .map(|s| s.to_string())
}

/// The RFC 3875 meta-variables plus `HTTP_*` headers.
pub fn build_env(
    request: &HttpRequestParser,
    script_path: &Path,
    server_name: &str,
    server_port: u16,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SERVER_SOFTWARE".to_string(), crate::http::SERVER_NAME.to_string());
    env.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
    env.insert("SERVER_NAME".to_string(), server_name.to_string());
    env.insert("SERVER_PORT".to_string(), server_port.to_string());
    env.insert("REQUEST_METHOD".to_string(), request.method.to_string());
    env.insert("QUERY_STRING".to_string(), request.query.clone());
    env.insert("SCRIPT_NAME".to_string(), request.path.clone());
    env.insert(
        "SCRIPT_FILENAME".to_string(),
        script_path.to_string_lossy().into_owned(),
    );
    if let Some(ct) = request.headers.get("content-type") {
        env.insert("CONTENT_TYPE".to_string(), ct.clone());
    }
    if let Some(cl) = request.headers.get("content-length") {
        env.insert("CONTENT_LENGTH".to_string(), cl.clone());
    } else if !request.body.is_empty() {
        env.insert("CONTENT_LENGTH".to_string(), request.body.len().to_string());
    }

    for (name, value) in &request.headers {
        if name == "content-type" || name == "content-length" {
            continue;
        }
        let env_name = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        env.insert(env_name, value.clone());
    }

    env
}

#[derive(Debug)]
pub struct CgiRequest {
    pub interpreter: String,
    pub script_path: PathBuf,
    pub env: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A forked-and-running CGI child: the pipe the reactor polls, plus
/// enough state to reap the child and parse its output once it signals
/// EOF.
pub struct CgiProcess {
    pub child: Child,
    pub out_file: File,
}

#[derive(Debug, thiserror::Error)]
pub enum CgiError {
    #[error("interpreter not found: {0}")]
    InterpreterMissing(String),
    #[error("fork/exec failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write request body to CGI stdin: {0}")]
    StdinWrite(#[source] std::io::Error),
}

/// Forks the interpreter, writes the (already de-chunked) request body
/// to its stdin and closes that pipe, then hands back a pollable stdout
/// fd. Never blocks waiting on the child.
pub fn spawn(request: &CgiRequest) -> Result<CgiProcess, CgiError> {
    if !Path::new(&request.interpreter).exists() {
        return Err(CgiError::InterpreterMissing(request.interpreter.clone()));
    }

    let mut command = Command::new(&request.interpreter);
    command.arg(&request.script_path as &OsStr);
    command.env_clear();
    command.envs(&request.env);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());

    let mut child = command.spawn().map_err(CgiError::Spawn)?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    write_body(&mut stdin, &request.body).map_err(CgiError::StdinWrite)?;
    drop(stdin);

    let stdout = child.stdout.take().expect("stdout was piped");
    let out_fd = stdout.into_raw_fd();
    set_nonblocking(out_fd).map_err(CgiError::Spawn)?;
    let out_file = unsafe { File::from_raw_fd(out_fd) };

    Ok(CgiProcess { child, out_file })
}

fn write_body(pipe: &mut impl Write, body: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < body.len() {
        match pipe.write(&body[written..]) {
            Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Splits CGI output on the first `\r\n\r\n` or `\n\n`: headers above,
/// body below. A `Status` header (case-insensitive) supplies the
/// response status from its leading token; `Set-Cookie` lines are
/// surfaced individually instead of folded into the headers map.
pub fn parse_output(raw_output: &[u8]) -> Option<HttpResponse> {
    let (header_end, delimiter_len) = find_subsequence(raw_output, b"\r\n\r\n", 0)
        .map(|p| (p, 4))
        .or_else(|| find_subsequence(raw_output, b"\n\n", 0).map(|p| (p, 2)))?;

    let header_section = String::from_utf8_lossy(&raw_output[..header_end]).into_owned();
    let body = raw_output[header_end + delimiter_len..].to_vec();

    let mut status = 200u16;
    let mut response = HttpResponse::new(200);

    for line in header_section.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("status") {
            status = value
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200);
        } else if name.eq_ignore_ascii_case("set-cookie") {
            response.set_cookie.push(value);
        } else {
            response.set_header(name, value);
        }
    }

    response.status = status;
    response.reason = crate::http::status_text(status).to_string();
    response.body = body;
    response.headers.remove("content-length");
    response.set_header("content-length", response.body.len().to_string());
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_of_path() {
        assert_eq!(extension_of("/cgi/echo.py"), Some("py".to_string()));
        assert_eq!(extension_of("/cgi/noext"), None);
    }

    #[test]
    fn parse_output_splits_headers_and_body() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let response = parse_output(raw).unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(response.body, b"missing");
    }

    #[test]
    fn parse_output_defaults_to_200_without_status_header() {
        let raw = b"Content-Type: text/plain\r\n\r\nhello";
        let response = parse_output(raw).unwrap();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn parse_output_surfaces_multiple_set_cookie_lines() {
        let raw = b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\nbody";
        let response = parse_output(raw).unwrap();
        assert_eq!(response.set_cookie, vec!["a=1".to_string(), "b=2".to_string()]);
    }
}
