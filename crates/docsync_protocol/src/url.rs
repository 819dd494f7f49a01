//! URL helpers: form encoding, relative URL resolution, credential masking.

use ::url::{form_urlencoded, Url};

const MASK: &str = "---";

/// Encodes a query component the way HTML form encoding does.
///
/// ASCII letters, digits and `.-*_` pass through, a space becomes `+`, and
/// every other byte of the UTF-8 encoding becomes `%XX` (uppercase hex).
pub fn form_encode(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

/// Encodes a single path segment such as a document ID.
///
/// Same as [`form_encode`] except that a space becomes `%20`.
pub fn encode_path_segment(text: &str) -> String {
    // A literal `+` is already escaped as `%2B`, so every `+` left is a space.
    form_encode(text).replace('+', "%20")
}

/// Returns `scheme://host[:port]` of a URL, without credentials or path.
///
/// Text that does not parse as a URL with a host is returned unchanged.
pub fn server_root(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if parsed.origin().is_tuple() => parsed.origin().ascii_serialization(),
        _ => url.to_string(),
    }
}

/// Resolves `relative` against a database URL.
///
/// A leading `/` resolves against the server root; anything else is appended
/// to the database path.
pub fn build_relative_url(db_url: &str, relative: &str) -> String {
    let joined = Url::parse(db_url).and_then(|mut base| {
        if !relative.starts_with('/') && !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(relative)
    });
    match joined {
        Ok(url) => url.into(),
        Err(_) => format!("{}/{}", db_url.trim_end_matches('/'), relative),
    }
}

/// Replaces `user:password@` in a URL with `---:---@` for logging.
///
/// URLs without credentials, and text that is not a URL, come back unchanged.
pub fn mask_credentials(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.username().is_empty() && parsed.password().is_none() {
        return url.to_string();
    }
    if parsed.set_username(MASK).is_err() || parsed.set_password(Some(MASK)).is_err() {
        return url.to_string();
    }
    parsed.into()
}
