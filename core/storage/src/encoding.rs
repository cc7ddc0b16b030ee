//! Percent-encoding helpers for object names in URLs.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// RFC 3986 unreserved characters stay as-is; everything else is escaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Like [`COMPONENT`] but keeps `/` so nested keys read as paths.
const PATH: &AsciiSet = &COMPONENT.remove(b'/');

/// Encode a single URL component (query key/value, path segment).
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Reverse of [`encode_component`].
///
/// Returns `None` unless `value` is exactly what [`encode_component`]
/// produces for some UTF-8 string, so each decoded value has one encoding.
pub fn decode_component(value: &str) -> Option<String> {
    let decoded = percent_decode_str(value).decode_utf8().ok()?.into_owned();
    (encode_component(&decoded) == value).then_some(decoded)
}

/// Encode a slash-separated path.
pub fn encode_path(value: &str) -> String {
    utf8_percent_encode(value, PATH).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        assert_eq!(encode_component("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(encode_path("photos/my cat.png"), "photos/my%20cat.png");
        assert_eq!(encode_component("attachment; filename=\"x\""), "attachment%3B%20filename%3D%22x%22");
    }

    #[test]
    fn test_decode_component() {
        assert_eq!(decode_component("a%20b%2Fc~d").as_deref(), Some("a b/c~d"));
        assert_eq!(decode_component("a%252Fb").as_deref(), Some("a%2Fb"));
        // Lowercase escapes and raw reserved characters have another canonical form.
        assert_eq!(decode_component("a%2fb"), None);
        assert_eq!(decode_component("a b"), None);
        assert_eq!(decode_component("%FF"), None);
    }
}
