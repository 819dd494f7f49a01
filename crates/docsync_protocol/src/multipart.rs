//! Multipart MIME framing.
//!
//! Documents with large attachments are uploaded as `multipart/related`: the
//! first part is the JSON document whose `_attachments` entries carry
//! `"follows": true`, followed by one part per attachment in the same order.
//! `_bulk_get` answers with `multipart/mixed`, one part per requested
//! revision, each of which may itself be `multipart/related`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::revision::JsonObject;
use uuid::Uuid;

const CRLF: &[u8] = b"\r\n";

/// One part of a multipart body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    /// Part headers in order of appearance.
    pub headers: Vec<(String, String)>,
    /// Raw part body.
    pub body: Vec<u8>,
}

impl Part {
    /// Creates a part from headers and body.
    pub fn new(headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the `Content-Type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// Returns true if the part is a JSON document.
    pub fn is_json(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
    }

    /// Parses the body as a JSON object.
    pub fn json_object(&self) -> ProtocolResult<JsonObject> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Builds a multipart body.
#[derive(Debug, Clone)]
pub struct MultipartWriter {
    subtype: String,
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartWriter {
    /// Creates a writer for `multipart/<subtype>` with a random boundary.
    pub fn new(subtype: impl Into<String>) -> Self {
        Self::with_boundary(subtype, Uuid::new_v4().simple().to_string())
    }

    /// Creates a writer with a fixed boundary.
    pub fn with_boundary(subtype: impl Into<String>, boundary: impl Into<String>) -> Self {
        Self {
            subtype: subtype.into(),
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    /// Returns the boundary string.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Returns the value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/{}; boundary=\"{}\"", self.subtype, self.boundary)
    }

    /// Appends a JSON part.
    pub fn add_json(&mut self, document: &JsonObject) -> ProtocolResult<()> {
        let body = serde_json::to_vec(document)?;
        self.add_part(
            vec![("Content-Type".into(), "application/json".into())],
            body,
        );
        Ok(())
    }

    /// Appends an attachment part.
    pub fn add_attachment(&mut self, name: &str, content_type: Option<&str>, body: Vec<u8>) {
        let mut headers = vec![(
            "Content-Disposition".to_string(),
            format!("attachment; filename=\"{}\"", name.replace('"', "\\\"")),
        )];
        if let Some(content_type) = content_type {
            headers.push(("Content-Type".into(), content_type.into()));
        }
        self.add_part(headers, body);
    }

    /// Appends an arbitrary part.
    pub fn add_part(&mut self, headers: Vec<(String, String)>, body: Vec<u8>) {
        self.parts.push(Part::new(headers, body));
    }

    /// Returns the number of parts added so far.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Returns true if no parts were added.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Renders the complete body.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(CRLF);
            for (name, value) in &part.headers {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(CRLF);
            }
            out.extend_from_slice(CRLF);
            out.extend_from_slice(&part.body);
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--");
        out.extend_from_slice(CRLF);
        out
    }
}

/// Extracts the `boundary` parameter from a `multipart/*` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (media_type, params) = content_type.split_once(';')?;
    if !media_type.trim().to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Splits a multipart body into its parts.
pub fn parse_multipart(body: &[u8], boundary: &str) -> ProtocolResult<Vec<Part>> {
    let delimiter = [b"--", boundary.as_bytes()].concat();
    let inner_delimiter = [CRLF, delimiter.as_slice()].concat();

    let mut cursor = find(body, &delimiter, 0)
        .ok_or_else(|| ProtocolError::Multipart("opening boundary not found".into()))?
        + delimiter.len();

    let mut parts = Vec::new();
    loop {
        if body[cursor..].starts_with(b"--") {
            return Ok(parts);
        }
        // Skip transport padding up to the end of the delimiter line.
        let line_end = find(body, CRLF, cursor)
            .ok_or_else(|| ProtocolError::Multipart("truncated boundary line".into()))?;
        let content_start = line_end + CRLF.len();
        let content_end = find(body, &inner_delimiter, content_start)
            .ok_or_else(|| ProtocolError::Multipart("closing boundary not found".into()))?;
        parts.push(parse_part(&body[content_start..content_end])?);
        cursor = content_end + inner_delimiter.len();
    }
}

fn parse_part(content: &[u8]) -> ProtocolResult<Part> {
    let (header_block, body) = if content.starts_with(CRLF) {
        (&content[..0], &content[CRLF.len()..])
    } else {
        let split = find(content, b"\r\n\r\n", 0)
            .ok_or_else(|| ProtocolError::Multipart("part headers not terminated".into()))?;
        (&content[..split], &content[split + 4..])
    };

    let header_text = std::str::from_utf8(header_block)
        .map_err(|_| ProtocolError::Multipart("part headers are not UTF-8".into()))?;
    let headers = header_text
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| ProtocolError::Multipart(format!("malformed header line {line:?}")))
        })
        .collect::<ProtocolResult<Vec<_>>>()?;

    Ok(Part::new(headers, body.to_vec()))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|index| index + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writer_then_parser() {
        let mut writer = MultipartWriter::with_boundary("related", "XYZ");
        let doc = json!({"_id": "a", "_attachments": {"f.txt": {"follows": true}}});
        writer.add_json(doc.as_object().unwrap()).unwrap();
        writer.add_attachment("f.txt", Some("text/plain"), b"hello".to_vec());
        assert_eq!(writer.content_type(), "multipart/related; boundary=\"XYZ\"");
        assert_eq!(writer.len(), 2);

        let body = writer.finish();
        let parts = parse_multipart(&body, "XYZ").unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_json());
        assert_eq!(parts[0].json_object().unwrap()["_id"], "a");
        assert_eq!(parts[1].body, b"hello");
        assert_eq!(
            parts[1].header("content-disposition"),
            Some("attachment; filename=\"f.txt\"")
        );
    }

    #[test]
    fn parses_preamble_and_headerless_parts() {
        let body = b"preamble\r\n--b\r\n\r\nraw\r\n--b\r\nContent-Type: application/json\r\n\r\n{}\r\n--b--\r\n";
        let parts = parse_multipart(body, "b").unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].headers.is_empty());
        assert_eq!(parts[0].body, b"raw");
        assert!(parts[1].is_json());
    }

    #[test]
    fn body_may_contain_dashes() {
        let body = b"--b\r\n\r\n--not-the-boundary\r\n--b--";
        let parts = parse_multipart(body, "b").unwrap();
        assert_eq!(parts[0].body, b"--not-the-boundary");
    }

    #[test]
    fn truncated_body_is_an_error() {
        assert!(parse_multipart(b"--b\r\n\r\nnever closed", "b").is_err());
        assert!(parse_multipart(b"no boundary at all", "b").is_err());
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/mixed; boundary=\"abc\"").as_deref(),
            Some("abc")
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Related;charset=utf-8; Boundary=x1").as_deref(),
            Some("x1")
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
        assert_eq!(boundary_from_content_type("text/plain; boundary=x"), None);
    }

    #[test]
    fn random_boundaries_differ() {
        assert_ne!(
            MultipartWriter::new("related").boundary(),
            MultipartWriter::new("related").boundary()
        );
    }
}
