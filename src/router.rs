//! Virtual-host selection, longest-prefix location matching, the policy
//! pipeline, and custom error-page resolution. Routing lives directly
//! in the request-handling path rather than behind a separate
//! dispatcher object.

use std::path::Path;
use std::sync::Arc;

use crate::cgi;
use crate::config::{self, ErrorPageOwner, LocationConfig, ServerConfig};
use crate::http::{HttpRequestParser, HttpResponse, Method};
use crate::static_handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no location matches the request path")]
    NoLocationMatch,
}

/// What the router decided to do with a request: produce a response
/// outright, or hand off to the CGI subsystem (which the reactor must
/// fork/exec and register with the poll registry).
pub enum RouteOutcome {
    Response(HttpResponse),
    Cgi(cgi::CgiRequest),
}

/// Host header value with any `:port` suffix stripped.
fn host_without_port(host_header: &str) -> &str {
    host_header.split(':').next().unwrap_or(host_header)
}

/// First exact `server_name` match wins; absent that, an explicit
/// `default_server` flag wins; absent that, the first server in the
/// candidate list.
pub fn select_server<'a>(
    candidates: &'a [Arc<ServerConfig>],
    host_header: Option<&str>,
) -> &'a Arc<ServerConfig> {
    if let Some(host) = host_header {
        let name = host_without_port(host);
        if let Some(server) = candidates
            .iter()
            .find(|s| s.server_names.iter().any(|n| n == name))
        {
            return server;
        }
    }
    if let Some(server) = candidates.iter().find(|s| s.default_server) {
        return server;
    }
    &candidates[0]
}

/// Runs the full policy pipeline for a completed request against the
/// chosen server, returning either a ready response or a CGI dispatch
/// for the reactor to execute asynchronously.
pub fn route(
    request: &HttpRequestParser,
    server: &ServerConfig,
    server_port: u16,
) -> Result<RouteOutcome, RoutingError> {
    if request.malformed {
        return Ok(RouteOutcome::Response(HttpResponse::new(400)));
    }

    let location = server.select_location(&request.path);
    let Some(location) = location else {
        return Err(RoutingError::NoLocationMatch);
    };

    if let Some(allowed) = config::effective_allow_methods(Some(location)) {
        if !request.method.is_allowed(allowed) {
            return Ok(RouteOutcome::Response(HttpResponse::new(405)));
        }
    }

    if request.too_large {
        return Ok(RouteOutcome::Response(HttpResponse::new(413)));
    }

    if let Some(ret) = &location.r#return {
        if ret.code != 0 {
            return Ok(RouteOutcome::Response(HttpResponse::redirect(ret.code, &ret.url)));
        }
    }

    let Some(sanitized) = static_handler::sanitize_path(&request.path) else {
        return Ok(RouteOutcome::Response(HttpResponse::new(403)));
    };

    if let Some(ext) = cgi::is_cgi_eligible(&request.path, location) {
        return dispatch_cgi(request, server, location, server_port, &ext, &sanitized).map(RouteOutcome::Cgi);
    }

    let full_path = static_handler::compose_full_path(server, Some(location), &sanitized);

    let response = match request.method {
        Method::GET => get_or_autoindex(&full_path, server, location, &request.path),
        Method::HEAD => {
            let mut response = get_or_autoindex(&full_path, server, location, &request.path);
            response.clear_body_keep_length();
            response
        }
        Method::POST => static_handler::handle_post(
            location,
            request.headers.get("content-type").map(|s| s.as_str()),
            &request.body,
            request.chunked,
        ),
        Method::DELETE => static_handler::handle_delete(&full_path),
    };

    Ok(RouteOutcome::Response(response))
}

/// `GET`/`HEAD` share the same directory-vs-file handling, but directory
/// autoindex needs the original URL (not just the filesystem path) to
/// build hrefs.
fn get_or_autoindex(
    full_path: &Path,
    server: &ServerConfig,
    location: &LocationConfig,
    url_path: &str,
) -> HttpResponse {
    if full_path.is_dir() {
        let index_files = config::effective_index(server, Some(location));
        for index_name in index_files {
            let candidate = full_path.join(index_name);
            if candidate.is_file() {
                return static_handler::handle_get(&candidate);
            }
        }
        if location.autoindex {
            return static_handler::render_autoindex(full_path, url_path);
        }
        return HttpResponse::new(403);
    }
    static_handler::handle_get(full_path)
}

fn dispatch_cgi(
    request: &HttpRequestParser,
    server: &ServerConfig,
    location: &LocationConfig,
    server_port: u16,
    ext: &str,
    sanitized_path: &str,
) -> Result<cgi::CgiRequest, RoutingError> {
    let Some(interpreter) = cgi::interpreter_for(location, ext) else {
        return Err(RoutingError::NoLocationMatch);
    };

    let script_path = static_handler::compose_full_path(server, Some(location), sanitized_path);
    let server_name = server.server_names.first().cloned().unwrap_or_default();
    let env = cgi::build_env(request, &script_path, &server_name, server_port);

    Ok(cgi::CgiRequest {
        interpreter,
        script_path,
        env,
        body: request.body.clone(),
    })
}

/// After a sub-handler returns a ≥400 response, resolves a custom error
/// page: location map, then server map, then the built-in body. The
/// page is read relative to the *owner's* root.
pub fn apply_error_page(
    response: &mut HttpResponse,
    server: &ServerConfig,
    location: Option<&LocationConfig>,
) {
    if response.status < 400 {
        return;
    }
    let Some((path, owner)) = config::effective_error_page(server, location, response.status) else {
        // No configured page for this code: a response built with
        // `HttpResponse::new` already carries the built-in HTML body,
        // but a CGI response that only became an error after its status
        // line was parsed may still be empty — fill it in now.
        if response.body.is_empty() {
            response.set_body(
                crate::http::default_error_body(response.status, &response.reason).into_bytes(),
                "text/html",
            );
        }
        return;
    };

    let root = match owner {
        ErrorPageOwner::Location => location
            .and_then(|l| l.root.as_deref())
            .unwrap_or(server.root.as_str()),
        ErrorPageOwner::Server => server.root.as_str(),
    };
    let full_path = Path::new(root.trim_end_matches('/')).join(path.trim_start_matches('/'));

    if let Ok(body) = std::fs::read(&full_path) {
        response.set_body(body, "text/html");
    }
}

/// `Connection: keep-alive` / `Connection: close`, the final pipeline
/// step.
pub fn apply_connection_header(response: &mut HttpResponse, keep_alive: bool) {
    response.set_header("connection", if keep_alive { "keep-alive" } else { "close" });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn server(name: &str, default: bool) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            listen: 8080,
            host: None,
            server_names: vec![name.to_string()],
            root: ".".into(),
            index: vec![],
            client_max_body_size: None,
            error_page: HashMap::new(),
            locations: vec![],
            default_server: default,
        })
    }

    #[test]
    fn exact_host_match_wins() {
        let candidates = vec![server("a", false), server("b", false)];
        let chosen = select_server(&candidates, Some("b:8080"));
        assert_eq!(chosen.server_names[0], "b");
    }

    #[test]
    fn no_match_falls_back_to_default_flag() {
        let candidates = vec![server("a", false), server("b", true)];
        let chosen = select_server(&candidates, Some("nonexistent"));
        assert_eq!(chosen.server_names[0], "b");
    }

    #[test]
    fn no_match_and_no_default_falls_back_to_first() {
        let candidates = vec![server("a", false), server("b", false)];
        let chosen = select_server(&candidates, Some("nonexistent"));
        assert_eq!(chosen.server_names[0], "a");
    }

    #[test]
    fn host_port_suffix_stripped() {
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
    }
}
