use tracing::debug;

use crate::error::DownloadError;
use crate::net::{HeadResponse, HttpClient, HttpRequest};
use crate::types::ServerCapabilities;

/// HEAD-based capability discovery: one request, redirect-following, and
/// the answer is treated as immutable for the rest of the task run.
pub struct NetworkProbe;

impl NetworkProbe {
    pub fn probe(
        client: &dyn HttpClient,
        request: &HttpRequest,
    ) -> Result<ServerCapabilities, DownloadError> {
        let response = client.head(request)?;
        let caps = capabilities_from_head(&response);

        if !caps.is_valid() {
            let mut error = DownloadError::from_http_status(caps.http_status);
            error.details = format!("probe of {} failed", request.url);
            return Err(error);
        }

        debug!(
            status = caps.http_status,
            length = caps.content_length,
            ranges = caps.supports_ranges,
            "probe completed"
        );
        Ok(caps)
    }
}

pub fn capabilities_from_head(response: &HeadResponse) -> ServerCapabilities {
    ServerCapabilities {
        supports_ranges: response.accept_ranges,
        supports_compression: response.content_encoding.is_some(),
        content_length: response.content_length.unwrap_or(-1),
        content_type: response.content_type.clone(),
        file_name: response
            .content_disposition
            .as_deref()
            .and_then(filename_from_content_disposition),
        etag: response.etag.clone().map(|value| trim_quotes(&value)),
        last_modified: response.last_modified.clone(),
        http_status: response.status,
    }
}

/// Pull a filename out of `Content-Disposition`, preferring the RFC 5987
/// `filename*=` form, URL-decoded and unquoted.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut filename_star: Option<String> = None;
    let mut filename: Option<String> = None;

    for part in value.split(';') {
        let part = part.trim();
        if part.to_ascii_lowercase().starts_with("filename*=") {
            let raw = part.splitn(2, '=').nth(1)?.trim().trim_matches('"');
            let decoded = if let Some(idx) = raw.find("''") {
                percent_decode(&raw[idx + 2..])
            } else {
                percent_decode(raw)
            };
            if !decoded.is_empty() {
                filename_star = Some(decoded);
            }
        } else if part.to_ascii_lowercase().starts_with("filename=") {
            let raw = part.splitn(2, '=').nth(1)?.trim().trim_matches('"');
            if !raw.is_empty() {
                filename = Some(percent_decode(raw));
            }
        }
    }

    filename_star.or(filename).map(|name| sanitize_filename(&name))
}

pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let name = parsed.path().rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        let mut decoded = percent_decode(name);
        if decoded.contains('+') {
            decoded = decoded.replace('+', " ");
        }
        let sanitized = sanitize_filename(&decoded);
        if sanitized == "download.bin" && decoded.trim().is_empty() {
            None
        } else {
            Some(sanitized)
        }
    }
}

fn percent_decode(value: &str) -> String {
    let mut out = String::new();
    let bytes = value.as_bytes();
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
            {
                let decoded = (hi << 4) | lo;
                if decoded.is_ascii() && decoded >= 0x20 && decoded != b'/' && decoded != b'\\' {
                    out.push(decoded as char);
                } else {
                    out.push('_');
                }
                index += 3;
                continue;
            }
        }
        let ch = bytes[index];
        if ch.is_ascii() && ch != b'/' && ch != b'\\' {
            out.push(ch as char);
        } else {
            out.push('_');
        }
        index += 1;
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for ch in name.chars() {
        let normalized = match ch {
            '+' => ' ',
            _ => ch,
        };
        let allowed = normalized.is_ascii_alphanumeric()
            || matches!(normalized, '.' | '_' | '-' | ' ' | '(' | ')' | '[' | ']');
        let mapped = if allowed { normalized } else { '_' };
        if mapped == '_' || mapped == ' ' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
            out.push(mapped);
        } else {
            last_was_sep = false;
            out.push(mapped);
        }
    }
    let trimmed = out.trim_matches(&[' ', '.', '_'][..]).trim();
    if trimmed.is_empty() {
        "download.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

fn trim_quotes(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(status: u16) -> HeadResponse {
        HeadResponse {
            status,
            final_url: "http://example.com/f.bin".to_string(),
            ..HeadResponse::default()
        }
    }

    #[test]
    fn capabilities_reflect_headers() {
        let mut resp = head(200);
        resp.content_length = Some(10_485_760);
        resp.accept_ranges = true;
        resp.content_type = Some("application/zip".to_string());
        resp.etag = Some("\"abc123\"".to_string());
        resp.content_encoding = Some("gzip".to_string());

        let caps = capabilities_from_head(&resp);
        assert!(caps.is_valid());
        assert!(caps.can_segment());
        assert!(caps.supports_compression);
        assert_eq!(caps.content_length, 10_485_760);
        assert_eq!(caps.etag.as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_length_reads_as_unknown() {
        let caps = capabilities_from_head(&head(200));
        assert_eq!(caps.content_length, -1);
        assert!(!caps.can_segment());
    }

    #[test]
    fn content_disposition_plain_filename() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=data.tar.gz"),
            Some("data.tar.gz".to_string())
        );
    }

    #[test]
    fn content_disposition_rfc5987_wins() {
        assert_eq!(
            filename_from_content_disposition(
                "attachment; filename=\"fallback.bin\"; filename*=UTF-8''my%20file.iso"
            ),
            Some("my file.iso".to_string())
        );
    }

    #[test]
    fn content_disposition_without_filename() {
        assert_eq!(filename_from_content_disposition("inline"), None);
    }

    #[test]
    fn filename_from_url_decodes_path() {
        assert_eq!(
            filename_from_url("https://host/dir/My%20File.zip?sig=1"),
            Some("My File.zip".to_string())
        );
        assert_eq!(filename_from_url("https://host/dir/"), None);
    }

    #[test]
    fn sanitization_strips_path_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("   "), "download.bin");
        assert_eq!(sanitize_filename("a  b.txt"), "a b.txt");
    }
}
