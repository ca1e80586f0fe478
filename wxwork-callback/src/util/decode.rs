//! Query parameter decoding.
//!
//! axum has already form-decoded the query by the time a handler runs, but
//! some proxies forward values still percent-encoded. Decoding a second time
//! is a no-op for values without `%` escapes, so both shapes are accepted.

use std::borrow::Cow;

use percent_encoding::percent_decode_str;
use tracing::warn;

/// Percent-decode `value` without turning `+` into a space.
///
/// Sequences that do not decode to UTF-8 leave the input untouched.
pub fn url_decode(value: &str) -> Cow<'_, str> {
    match percent_decode_str(value).decode_utf8() {
        Ok(decoded) => decoded,
        Err(_) => {
            warn!(value_length = value.len(), "url_decode_invalid_utf8");
            Cow::Borrowed(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_escapes() {
        assert_eq!(url_decode("abc%2Bdef%3D%3D"), "abc+def==");
        assert_eq!(url_decode("a%2Fb"), "a/b");
    }

    #[test]
    fn test_plain_value_is_unchanged() {
        let echostr = "P9nAzCzyDtyTWESHep1vC5X9xho/qYX3Zpb4yKa9SKld1DsH3Iyt3tP3zNdtp+4RPcs8TgAE7OaBO+FZXvnaqQ==";
        assert_eq!(url_decode(echostr), echostr);
        assert!(matches!(url_decode("1409659589"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_plus_is_preserved() {
        assert_eq!(url_decode("a+b"), "a+b");
    }

    #[test]
    fn test_invalid_utf8_falls_back() {
        assert_eq!(url_decode("%FF%FE"), "%FF%FE");
    }

    #[test]
    fn test_incomplete_escape_is_literal() {
        assert_eq!(url_decode("100%"), "100%");
    }
}
