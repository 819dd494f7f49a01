//! Authentication challenge parsing and server identification.

use std::collections::BTreeMap;

/// `Server` header prefix announced by Sync Gateway.
pub const SYNC_GATEWAY_SERVER_PREFIX: &str = "Couchbase Sync Gateway/";

/// Parses a `WWW-Authenticate` header into a challenge map.
///
/// The map holds the raw header under `WWW-Authenticate`, the scheme under
/// `Scheme`, and one entry per `key=value` parameter (values may be quoted).
/// Returns `None` for a missing or blank header.
pub fn parse_auth_header(header: Option<&str>) -> Option<BTreeMap<String, String>> {
    let header = header?;
    let trimmed = header.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut challenge = BTreeMap::new();
    challenge.insert("WWW-Authenticate".to_string(), header.to_string());

    let (scheme, mut rest) = match trimmed.split_once(char::is_whitespace) {
        Some((scheme, rest)) => (scheme, rest.trim_start()),
        None => (trimmed, ""),
    };
    challenge.insert("Scheme".to_string(), scheme.to_string());

    while !rest.is_empty() {
        let Some((key, after_eq)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim();
        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            read_quoted(quoted)
        } else {
            match after_eq.split_once(',') {
                Some((value, remainder)) => (value.trim().to_string(), remainder),
                None => (after_eq.trim().to_string(), ""),
            }
        };
        if !key.is_empty() {
            challenge.insert(key.to_string(), value);
        }
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Some(challenge)
}

/// Reads a quoted string body (after the opening quote); returns the
/// unescaped value and the text after the closing quote.
fn read_quoted(text: &str) -> (String, &str) {
    let mut value = String::new();
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        match ch {
            _ if escaped => {
                value.push(ch);
                escaped = false;
            }
            '\\' => escaped = true,
            '"' => return (value, &text[index + 1..]),
            _ => value.push(ch),
        }
    }
    (value, "")
}

/// Returns true if `server_header` names a Sync Gateway at or above
/// `min_version`.
///
/// Versions are compared as plain strings, so developer builds such as
/// `unofficial` sort above every numbered release.
pub fn server_is_sync_gateway_version(server_header: Option<&str>, min_version: &str) -> bool {
    server_header
        .and_then(|server| server.strip_prefix(SYNC_GATEWAY_SERVER_PREFIX))
        .is_some_and(|version| version >= min_version)
}
