//! Directory listing generation: HTML-escaped display names,
//! percent-encoded `href`s, `YYYY-MM-DD HH:MM:SS` timestamps, B/KB/MB
//! sizes, an entry cap with a trailing notice row.

use std::fs::DirEntry;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::config::AUTOINDEX_ENTRY_CAP;

pub fn generate(dir: &Path, url_path: &str) -> String {
    let mut entries: Vec<DirEntry> = match std::fs::read_dir(dir) {
        Ok(read) => read.filter_map(|e| e.ok()).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort_by_key(|e| e.file_name());

    let mut body = String::new();
    body.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\">");
    body.push_str(&format!("<title>Index of {}</title></head>\n<body>\n", escape_html(url_path)));
    body.push_str(&format!("<h1>Index of {}</h1>\n<hr>\n<pre>\n", escape_html(url_path)));

    if url_path != "/" {
        let parent = parent_url(url_path);
        body.push_str(&format!("<a href=\"{}\">../</a>\n", percent_encode_href(&parent)));
    }

    let truncated = entries.len() > AUTOINDEX_ENTRY_CAP;
    for entry in entries.iter().take(AUTOINDEX_ENTRY_CAP) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let is_dir = metadata.is_dir();
        let display_name = if is_dir { format!("{name}/") } else { name.clone() };
        let href_name = if is_dir { format!("{name}/") } else { name.clone() };
        let modified = format_modified(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH));
        let size = if is_dir {
            "-".to_string()
        } else {
            format_size(metadata.len())
        };

        body.push_str(&format!(
            "<a href=\"{}\">{}</a>  {}  {}\n",
            percent_encode_href(&href_name),
            escape_html(&display_name),
            modified,
            size,
        ));
    }

    if truncated {
        body.push_str(&format!(
            "\n... listing truncated at {AUTOINDEX_ENTRY_CAP} entries ...\n"
        ));
    }

    body.push_str("</pre>\n<hr>\n</body>\n</html>\n");
    body
}

fn parent_url(url_path: &str) -> String {
    let trimmed = url_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => format!("{}/", &trimmed[..=idx]),
        None => "/".to_string(),
    }
}

fn format_modified(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Percent-encodes a path segment for use as an `href`: space -> `%20`,
/// the RFC 3986 unreserved set preserved verbatim, everything else
/// encoded as `%` followed by two uppercase hex digits.
pub fn percent_encode_href(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

pub fn percent_decode_href(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = bytes[i + 1];
            let lo = bytes[i + 2];
            if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                out.push(u8::from_str_radix(hex, 16).unwrap());
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn href_round_trips() {
        for name in ["a.txt", "b b.txt", "weird&name.txt", "unicode-é.txt"] {
            let encoded = percent_encode_href(name);
            assert_eq!(percent_decode_href(&encoded), name);
        }
    }

    #[test]
    fn html_escape_covers_ampersand_and_angle_brackets() {
        assert_eq!(escape_html("<a>&\"'"), "&lt;a&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn listing_contains_links_and_parent() {
        let dir = std::env::temp_dir().join(format!("autoindex_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.txt"), "hello").unwrap();
        fs::write(dir.join("b b.txt"), "hello2").unwrap();

        let html = generate(&dir, "/files/");
        assert!(html.contains("<a href=\"a.txt\">a.txt</a>"));
        assert!(html.contains("<a href=\"b%20b.txt\">b b.txt</a>"));
        assert!(html.contains("href=\"/\""));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0MB");
    }
}
