use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{Result, TunnelError};

/// Decodes the optional pre-handshake payload a client smuggles into the
/// `Sec-WebSocket-Protocol` negotiation header to save a round trip.
///
/// The value is URL-safe base64; padding is stripped before decoding since
/// `=` is not valid inside that header. An absent or empty value is not an
/// error — it simply means the first tunneled bytes arrive as a normal
/// WebSocket frame instead.
pub fn decode_early_data(header_value: &str) -> Result<Vec<u8>> {
    if header_value.is_empty() {
        return Ok(Vec::new());
    }
    let trimmed = header_value.trim_end_matches('=');
    URL_SAFE_NO_PAD.decode(trimmed).map_err(TunnelError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_no_early_data() {
        assert_eq!(decode_early_data("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn decodes_unpadded_urlsafe_base64() {
        assert_eq!(decode_early_data("aGVsbG8").unwrap(), b"hello");
    }

    #[test]
    fn strips_padding_before_decoding() {
        assert_eq!(decode_early_data("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn accepts_urlsafe_alphabet() {
        // 0xFB 0xEF encodes to characters outside the standard alphabet.
        assert_eq!(decode_early_data("--8").unwrap(), vec![0xFB, 0xEF]);
    }

    #[test]
    fn rejects_invalid_alphabet() {
        let err = decode_early_data("not!!base64").unwrap_err();
        assert!(matches!(err, TunnelError::Decode(_)));
    }
}
