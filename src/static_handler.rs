//! GET/HEAD/POST(upload)/DELETE against the filesystem: path
//! sanitization, root/alias composition, size-capped reads, and uploads.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::autoindex;
use crate::config::{self, LocationConfig, ServerConfig, STATIC_FILE_CAP};
use crate::http::{get_mime_type, HttpResponse};

/// Sanitizes a decoded request path: drop `.` segments, pop on `..`
/// (forbidden past root), preserve a trailing slash. Returns `None` for
/// a forbidden result.
pub fn sanitize_path(path: &str) -> Option<String> {
    if path.is_empty() {
        return Some("/".to_string());
    }
    if !path.starts_with('/') {
        return None;
    }
    let trailing_slash = path.len() > 1 && path.ends_with('/');

    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return None;
                }
            }
            other => stack.push(other),
        }
    }

    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    if trailing_slash && out != "/" {
        out.push('/');
    }
    Some(out)
}

/// Composes the filesystem path a sanitized request path resolves to:
/// alias replaces the matched location prefix; root is appended.
/// Trailing slashes on root/alias are normalized away first.
pub fn compose_full_path(
    server: &ServerConfig,
    location: Option<&LocationConfig>,
    sanitized_path: &str,
) -> PathBuf {
    let (base, remainder): (&str, &str) = match location {
        Some(loc) if loc.alias.is_some() => {
            let alias = loc.alias.as_deref().unwrap();
            let remainder = sanitized_path.strip_prefix(loc.path.as_str()).unwrap_or(sanitized_path);
            (alias, remainder)
        }
        Some(loc) => {
            let root = loc.root.as_deref().unwrap_or(server.root.as_str());
            (root, sanitized_path)
        }
        None => (server.root.as_str(), sanitized_path),
    };

    let base = base.trim_end_matches('/');
    let remainder = remainder.trim_start_matches('/');
    let mut full = PathBuf::from(base);
    if !remainder.is_empty() {
        full.push(remainder);
    }
    full
}

pub fn handle_get(full_path: &Path) -> HttpResponse {
    let metadata = match fs::symlink_metadata(full_path) {
        Ok(m) => m,
        Err(e) => return not_found_or_forbidden(e),
    };

    if metadata.file_type().is_symlink() {
        return HttpResponse::new(403);
    }

    if metadata.is_dir() {
        // The router resolves index/autoindex/403 before ever handing a
        // directory path to this function (it needs the request's URL
        // path, which isn't available here, to build autoindex hrefs).
        return HttpResponse::new(404);
    }

    if metadata.len() as usize > STATIC_FILE_CAP {
        return HttpResponse::new(413);
    }

    match read_file_no_follow(full_path) {
        Ok(bytes) => {
            let mime = get_mime_type(full_path.extension().and_then(|e| e.to_str()));
            let mut response = HttpResponse::new(200);
            response.set_body(bytes, mime);
            response
        }
        Err(e) => not_found_or_forbidden(e),
    }
}

/// Directory responses need the original URL path (not just the
/// filesystem dir) to build hrefs and the parent link; the router calls
/// this directly instead of going through `handle_get` for that reason.
pub fn render_autoindex(dir: &Path, url_path: &str) -> HttpResponse {
    let body = autoindex::generate(dir, url_path);
    let mut response = HttpResponse::new(200);
    response.set_body(body.into_bytes(), "text/html");
    response
}

fn not_found_or_forbidden(e: std::io::Error) -> HttpResponse {
    match e.kind() {
        ErrorKind::NotFound => HttpResponse::new(404),
        ErrorKind::PermissionDenied => HttpResponse::new(403),
        _ => HttpResponse::new(500),
    }
}

fn read_file_no_follow(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut options = OpenOptions::new();
    options.read(true);
    let mut file = open_no_symlink(&mut options, path)?;
    let mut buf = Vec::new();
    loop {
        match file.read_to_end(&mut buf) {
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(buf)
}

#[cfg(unix)]
fn open_no_symlink(options: &mut OpenOptions, path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    options.custom_flags(libc::O_NOFOLLOW).open(path)
}

#[cfg(not(unix))]
fn open_no_symlink(options: &mut OpenOptions, path: &Path) -> std::io::Result<File> {
    options.open(path)
}

/// POST is purpose-built for uploads.
pub fn handle_post(
    location: &LocationConfig,
    content_type: Option<&str>,
    body: &[u8],
    chunked: bool,
) -> HttpResponse {
    if chunked {
        return HttpResponse::new(501);
    }

    let Some(upload_dir) = location.upload_path.as_ref() else {
        return HttpResponse::new(500);
    };

    if let Err(e) = fs::create_dir_all(upload_dir) {
        if e.kind() != ErrorKind::AlreadyExists {
            return HttpResponse::new(500);
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(upload_dir, fs::Permissions::from_mode(0o755));
    }

    if let Some(boundary) = extract_boundary(content_type) {
        save_multipart(upload_dir, &boundary, body)
    } else {
        save_single_file(upload_dir, body)
    }
}

fn extract_boundary(content_type: Option<&str>) -> Option<String> {
    let content_type = content_type?;
    if !content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
        return None;
    }
    content_type
        .split(';')
        .find_map(|part| part.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
}

fn unique_upload_name() -> String {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let pid = std::process::id();
    let rand_component: u32 = rand::thread_rng().gen();
    format!("upload_{time}_{pid}_{rand_component}")
}

fn save_single_file(upload_dir: &str, body: &[u8]) -> HttpResponse {
    let filename = unique_upload_name();
    let full_path = Path::new(upload_dir).join(&filename);

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    set_mode_0644(&mut options);
    let mut file = match options.open(&full_path) {
        Ok(f) => f,
        Err(_) => return HttpResponse::new(500),
    };

    if let Err(_) = write_all_retrying(&mut file, body) {
        let _ = fs::remove_file(&full_path);
        return HttpResponse::new(500);
    }
    let _ = file.sync_all();
    drop(file);

    created_response(&full_path)
}

fn created_response(full_path: &Path) -> HttpResponse {
    let location_header = format!("/{}", full_path.to_string_lossy());
    let mut response = HttpResponse::new(201);
    response.set_header("location", location_header.clone());
    response.set_body(
        format!(
            "<html><body><h1>Upload complete</h1><p>{}</p></body></html>",
            autoindex::escape_html(&location_header)
        )
        .into_bytes(),
        "text/html",
    );
    response
}

fn write_all_retrying(file: &mut File, data: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Splits a `multipart/form-data` body on its boundary, saving each file
/// part (one carrying a `filename=` in its `Content-Disposition`)
/// individually. Non-file fields are parsed but not persisted.
fn save_multipart(upload_dir: &str, boundary: &str, body: &[u8]) -> HttpResponse {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut saved = Vec::new();
    let mut cursor = 0;

    while let Some(start) = find_subsequence(body, &delimiter, cursor) {
        let part_start = start + delimiter.len();
        if body.get(part_start..part_start + 2) == Some(b"--") {
            break;
        }
        let data_start = match body.get(part_start..part_start + 2) {
            Some(b"\r\n") => part_start + 2,
            _ => part_start,
        };

        let Some(header_end) = find_subsequence(body, b"\r\n\r\n", data_start) else {
            break;
        };
        let headers = String::from_utf8_lossy(&body[data_start..header_end]).into_owned();
        let content_start = header_end + 4;

        let Some(next_boundary) = find_subsequence(body, &delimiter, content_start) else {
            break;
        };
        let content_end = next_boundary.saturating_sub(2).max(content_start);

        if let Some(filename) = extract_filename(&headers) {
            if !filename.is_empty() {
                let full_path = Path::new(upload_dir).join(sanitize_filename(&filename));
                if let Ok(mut file) = OpenOptions::new().write(true).create(true).truncate(true).open(&full_path) {
                    let _ = write_all_retrying(&mut file, &body[content_start..content_end]);
                    saved.push(full_path);
                }
            }
        }

        cursor = next_boundary;
    }

    match saved.first() {
        Some(path) => created_response(path),
        None => HttpResponse::new(500),
    }
}

fn extract_filename(headers: &str) -> Option<String> {
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-disposition") {
            for part in line.split(';') {
                let part = part.trim();
                if let Some(name) = part.strip_prefix("filename=") {
                    return Some(name.trim_matches('"').to_string());
                }
            }
        }
    }
    None
}

fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

pub fn handle_delete(full_path: &Path) -> HttpResponse {
    let metadata = match fs::symlink_metadata(full_path) {
        Ok(m) => m,
        Err(e) => {
            return match e.kind() {
                ErrorKind::PermissionDenied => HttpResponse::new(403),
                _ => HttpResponse::new(404),
            }
        }
    };

    if metadata.is_dir() {
        return HttpResponse::new(403);
    }

    if let Some(parent) = full_path.parent() {
        if let Ok(parent_meta) = fs::metadata(parent) {
            if parent_meta.permissions().readonly() {
                return HttpResponse::new(403);
            }
        }
    }

    match fs::remove_file(full_path) {
        Ok(()) => HttpResponse::new(204),
        Err(e) => match e.kind() {
            ErrorKind::PermissionDenied => HttpResponse::new(403),
            ErrorKind::NotFound => HttpResponse::new(404),
            _ => HttpResponse::new(500),
        },
    }
}

#[cfg(unix)]
fn set_mode_0644(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o644);
}

#[cfg(not(unix))]
fn set_mode_0644(_options: &mut OpenOptions) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_becomes_root() {
        assert_eq!(sanitize_path(""), Some("/".to_string()));
    }

    #[test]
    fn dot_segments_dropped() {
        assert_eq!(sanitize_path("/a/./b"), Some("/a/b".to_string()));
    }

    #[test]
    fn dotdot_pops_segment() {
        assert_eq!(sanitize_path("/a/b/../c"), Some("/a/c".to_string()));
    }

    #[test]
    fn dotdot_past_root_forbidden() {
        assert_eq!(sanitize_path("/../etc/passwd"), None);
        assert_eq!(sanitize_path("/a/../../etc"), None);
    }

    #[test]
    fn not_starting_with_slash_forbidden() {
        assert_eq!(sanitize_path("a/b"), None);
    }

    #[test]
    fn trailing_slash_preserved() {
        assert_eq!(sanitize_path("/a/b/"), Some("/a/b/".to_string()));
    }

    #[test]
    fn compose_with_root() {
        let server = test_server();
        let full = compose_full_path(&server, None, "/a/b");
        assert_eq!(full, PathBuf::from("./www/a/b"));
    }

    #[test]
    fn compose_with_alias_strips_location_prefix() {
        let server = test_server();
        let location = LocationConfig {
            path: "/files".into(),
            root: None,
            alias: Some("./uploads".into()),
            index: None,
            allow_methods: None,
            client_max_body_size: None,
            r#return: None,
            error_page: Default::default(),
            autoindex: false,
            upload_path: None,
            cgi_ext: vec![],
            cgi_path: vec![],
        };
        let full = compose_full_path(&server, Some(&location), "/files/a.txt");
        assert_eq!(full, PathBuf::from("./uploads/a.txt"));
    }

    fn test_server() -> ServerConfig {
        ServerConfig {
            listen: 8080,
            host: None,
            server_names: vec![],
            root: "./www".into(),
            index: vec![],
            client_max_body_size: None,
            error_page: Default::default(),
            locations: vec![],
            default_server: false,
        }
    }
}
