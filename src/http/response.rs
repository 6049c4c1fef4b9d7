//! Outgoing HTTP/1.1 responses.

use std::collections::HashMap;

use chrono::Utc;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub set_cookie: Vec<String>,
    pub body: Vec<u8>,
}

pub const SERVER_NAME: &str = "webserv";

impl HttpResponse {
    /// Error statuses (>= 400) get a minimal built-in HTML body up
    /// front; `router::apply_error_page` replaces it with a configured
    /// custom error page when one resolves.
    pub fn new(status: u16) -> Self {
        let mut response = HttpResponse {
            status,
            reason: status_text(status).to_string(),
            headers: HashMap::new(),
            set_cookie: Vec::new(),
            body: Vec::new(),
        };
        if status >= 400 {
            let body = default_error_body(status, response.reason.as_str());
            response.set_body(body.into_bytes(), "text/html");
        }
        response
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.set_header("content-length", body.len().to_string());
        self.set_header("content-type", content_type);
        self.body = body;
        self
    }

    pub fn clear_body_keep_length(&mut self) -> &mut Self {
        self.body.clear();
        self
    }

    pub fn redirect(status: u16, target: &str) -> Self {
        let mut res = HttpResponse::new(status);
        res.set_header("location", target);
        res.set_body(Vec::new(), "text/plain");
        res
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        out.extend_from_slice(format!("Server: {}\r\n", SERVER_NAME).as_bytes());
        out.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", to_header_case(name), value).as_bytes());
        }
        for cookie in &self.set_cookie {
            out.extend_from_slice(format!("Set-Cookie: {}\r\n", cookie).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn to_header_case(name: &str) -> String {
    name.split('-')
        .map(|w| {
            let mut c = w.chars();
            match c.next() {
                None => String::new(),
                Some(f) => f.to_ascii_uppercase().to_string() + c.as_str(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

pub fn get_mime_type(extension: Option<&str>) -> &'static str {
    match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub fn default_error_body(status: u16, reason: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{status} {reason}</title></head>\
         <body><center><h1>{status} {reason}</h1></center></body></html>\n"
    )
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_body_sets_length_and_type() {
        let mut res = HttpResponse::new(200);
        res.set_body(b"Hi".to_vec(), "text/html");
        assert_eq!(res.headers.get("content-length").unwrap(), "2");
        assert_eq!(res.headers.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn redirect_sets_location() {
        let res = HttpResponse::redirect(301, "/new");
        assert_eq!(res.status, 301);
        assert_eq!(res.headers.get("location").unwrap(), "/new");
    }
}
