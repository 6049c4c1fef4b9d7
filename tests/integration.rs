//! End-to-end coverage: spins up a real `Server` on a background thread
//! and drives it with plain `std::net::TcpStream` clients against the
//! actual socket surface.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use webserv_core::config::{AppConfig, LocationConfig, ServerConfig};
use webserv_core::Server;

fn temp_root(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("webserv_it_{label}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn base_location(path: &str) -> LocationConfig {
    LocationConfig {
        path: path.to_string(),
        root: None,
        alias: None,
        index: None,
        allow_methods: None,
        client_max_body_size: None,
        r#return: None,
        error_page: HashMap::new(),
        autoindex: false,
        upload_path: None,
        cgi_ext: vec![],
        cgi_path: vec![],
    }
}

fn base_server(port: u16, root: &std::path::Path) -> ServerConfig {
    ServerConfig {
        listen: port,
        host: Some("127.0.0.1".to_string()),
        server_names: vec!["localhost".to_string()],
        root: root.to_string_lossy().into_owned(),
        index: vec!["index.html".to_string()],
        client_max_body_size: None,
        error_page: HashMap::new(),
        locations: vec![base_location("/")],
        default_server: true,
    }
}

/// Binds and registers the listener synchronously (so a client can
/// connect the moment this returns) then hands the reactor loop to a
/// background thread.
fn start_server(config: AppConfig) {
    let mut server = Server::new(config).expect("server should bind and register");
    thread::spawn(move || {
        let _ = server.run();
    });
    thread::sleep(Duration::from_millis(50));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 8192];
    let mut out = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                // Once headers + a Content-Length body are fully in, stop
                // reading rather than blocking for the timeout.
                if let Some(body_start) = find(&out, b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&out[..body_start]);
                    if let Some(len) = headers
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                    {
                        if out.len() >= body_start + 4 + len {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[test]
fn serves_static_index_file() {
    let root = temp_root("static");
    std::fs::write(root.join("index.html"), "<h1>hi</h1>").unwrap();
    start_server(AppConfig {
        servers: vec![base_server(18080, &root)],
    });

    let mut stream = connect(18080);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("<h1>hi</h1>"));
}

#[test]
fn returns_404_for_missing_file() {
    let root = temp_root("missing");
    start_server(AppConfig {
        servers: vec![base_server(18081, &root)],
    });

    let mut stream = connect(18081);
    stream
        .write_all(b"GET /nope.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 404"));
}

#[test]
fn rejects_disallowed_method() {
    let root = temp_root("method");
    std::fs::write(root.join("index.html"), "hi").unwrap();
    let mut server = base_server(18082, &root);
    let mut location = base_location("/");
    location.allow_methods = Some(vec!["GET".to_string()]);
    server.locations = vec![location];
    start_server(AppConfig { servers: vec![server] });

    let mut stream = connect(18082);
    stream
        .write_all(b"DELETE /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 405"));
}

#[test]
fn keep_alive_serves_a_second_request_on_the_same_connection() {
    let root = temp_root("keepalive");
    std::fs::write(root.join("index.html"), "one").unwrap();
    std::fs::write(root.join("second.html"), "two").unwrap();
    start_server(AppConfig {
        servers: vec![base_server(18083, &root)],
    });

    let mut stream = connect(18083);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let first = read_response(&mut stream);
    assert!(first.contains("one"));

    stream
        .write_all(b"GET /second.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert!(second.contains("two"));
}

#[test]
fn pipelined_requests_in_one_write_both_get_answered() {
    let root = temp_root("pipeline");
    std::fs::write(root.join("index.html"), "one").unwrap();
    std::fs::write(root.join("second.html"), "two").unwrap();
    start_server(AppConfig {
        servers: vec![base_server(18084, &root)],
    });

    let mut stream = connect(18084);
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /second.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();

    let first = read_response(&mut stream);
    assert!(first.contains("one"));
    let second = read_response(&mut stream);
    assert!(second.contains("two"));
}

#[test]
fn chunked_upload_body_is_not_implemented() {
    let root = temp_root("chunked");
    let uploads = root.join("uploads");
    let mut server = base_server(18085, &root);
    let mut location = base_location("/upload");
    location.upload_path = Some(uploads.to_string_lossy().into_owned());
    server.locations = vec![location];
    start_server(AppConfig { servers: vec![server] });

    let mut stream = connect(18085);
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 501"));
}

#[test]
fn single_file_upload_is_saved_and_returns_201() {
    let root = temp_root("upload");
    let uploads = root.join("uploads");
    let mut server = base_server(18086, &root);
    let mut location = base_location("/upload");
    location.upload_path = Some(uploads.to_string_lossy().into_owned());
    server.locations = vec![location];
    start_server(AppConfig { servers: vec![server] });

    let mut stream = connect(18086);
    let body = b"payload bytes";
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 201"));
    let saved: Vec<_> = std::fs::read_dir(&uploads).unwrap().collect();
    assert_eq!(saved.len(), 1);
}

#[test]
fn path_traversal_is_forbidden() {
    let root = temp_root("traversal");
    std::fs::write(root.join("index.html"), "<h1>hi</h1>").unwrap();
    start_server(AppConfig {
        servers: vec![base_server(18088, &root)],
    });

    let mut stream = connect(18088);
    stream
        .write_all(b"GET /../../etc/passwd HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 403"));
}

#[test]
fn cgi_script_output_is_parsed_into_a_response() {
    let root = temp_root("cgi");
    let cgi_dir = root.join("cgi");
    std::fs::create_dir_all(&cgi_dir).unwrap();
    std::fs::write(
        cgi_dir.join("echo.sh"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nhello from cgi\\n'\n",
    )
    .unwrap();

    let mut server = base_server(18087, &root);
    let mut location = base_location("/cgi");
    location.cgi_ext = vec![".sh".to_string()];
    location.cgi_path = vec!["/bin/sh".to_string()];
    server.locations = vec![location];
    start_server(AppConfig { servers: vec![server] });

    let mut stream = connect(18087);
    stream
        .write_all(b"GET /cgi/echo.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("hello from cgi"));
}
