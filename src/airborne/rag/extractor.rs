//! Extractor (§4.10): `Extract(bytes, filename, mime) -> {text, page_count, metadata}`. Plain
//! text and markdown pass through unchanged. Other formats are delegated to an external
//! conversion service (multipart/form-data, `from`/`to=plain`); the URL is C6-validated with a
//! safe fallback if unreachable. Unknown formats fall back to reading as plain text with a
//! `fallback=true` marker.

use crate::airborne::url_validator;
use reqwest::multipart;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ExtractResult {
    pub text: String,
    pub page_count: u32,
    pub metadata: HashMap<String, String>,
}

fn is_passthrough(mime: &str, filename: &str) -> bool {
    mime.starts_with("text/plain")
        || mime == "text/markdown"
        || filename.ends_with(".txt")
        || filename.ends_with(".md")
}

fn lossy_text_fallback(bytes: &[u8]) -> ExtractResult {
    let mut metadata = HashMap::new();
    metadata.insert("fallback".to_string(), "true".to_string());
    ExtractResult {
        text: String::from_utf8_lossy(bytes).into_owned(),
        page_count: 1,
        metadata,
    }
}

/// Extract `text`/`page_count`/`metadata` from `bytes`, delegating non-plain formats to the
/// conversion service at `conversion_service_url` when one is configured.
pub async fn extract(
    bytes: &[u8],
    filename: &str,
    mime: &str,
    conversion_service_url: Option<&str>,
) -> ExtractResult {
    if is_passthrough(mime, filename) {
        return ExtractResult {
            text: String::from_utf8_lossy(bytes).into_owned(),
            page_count: 1,
            metadata: HashMap::new(),
        };
    }

    let Some(url) = conversion_service_url else {
        return lossy_text_fallback(bytes);
    };
    if url_validator::validate(url).is_err() {
        return lossy_text_fallback(bytes);
    }

    let client = crate::airborne::provider::common::shared_http_client();
    let part = multipart::Part::bytes(bytes.to_vec()).file_name(filename.to_string());
    let form = multipart::Form::new()
        .text("from", format_hint(mime, filename))
        .text("to", "plain")
        .part("file", part);

    match client.post(url).multipart(form).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(text) => ExtractResult { text, page_count: 1, metadata: HashMap::new() },
            Err(_) => lossy_text_fallback(bytes),
        },
        _ => lossy_text_fallback(bytes),
    }
}

fn format_hint(mime: &str, filename: &str) -> String {
    if let Some(ext) = filename.rsplit('.').next() {
        if ext != filename {
            return ext.to_string();
        }
    }
    mime.rsplit('/').next().unwrap_or(mime).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_passes_through() {
        let result = extract(b"hello world", "notes.txt", "text/plain", None).await;
        assert_eq!(result.text, "hello world");
        assert!(!result.metadata.contains_key("fallback"));
    }

    #[tokio::test]
    async fn markdown_passes_through_by_extension() {
        let result = extract(b"# title", "readme.md", "application/octet-stream", None).await;
        assert_eq!(result.text, "# title");
    }

    #[tokio::test]
    async fn unknown_format_without_service_falls_back() {
        let result = extract(b"binary junk", "file.docx", "application/vnd.whatever", None).await;
        assert_eq!(result.metadata.get("fallback"), Some(&"true".to_string()));
    }

    #[tokio::test]
    async fn unreachable_conversion_service_falls_back_safely() {
        let result = extract(
            b"binary junk",
            "file.docx",
            "application/vnd.whatever",
            Some("http://127.0.0.1:1/convert"),
        )
        .await;
        assert_eq!(result.metadata.get("fallback"), Some(&"true".to_string()));
    }

    #[test]
    fn format_hint_prefers_extension() {
        assert_eq!(format_hint("application/octet-stream", "report.docx"), "docx");
        assert_eq!(format_hint("application/pdf", "noext"), "pdf");
    }
}
