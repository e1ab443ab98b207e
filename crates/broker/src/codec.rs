//! Stream entry value encoding.
//!
//! Every entry carries a `codec` field naming how `value` was encoded, so
//! producers can change compression without breaking consumers of older
//! entries.

use courier_common::config::Compression;
use courier_common::types::NotificationMessage;

use crate::BrokerError;

pub const CODEC_NONE: &str = "none";
pub const CODEC_LZ4: &str = "lz4";

/// Encode `value`, returning the codec name and the bytes to store.
pub fn compress(value: &[u8], compression: Compression) -> (&'static str, Vec<u8>) {
    match compression {
        Compression::None => (CODEC_NONE, value.to_vec()),
        Compression::Lz4 => (CODEC_LZ4, lz4_flex::compress_prepend_size(value)),
    }
}

/// Reverse [`compress`] for an entry tagged with `codec`.
pub fn decompress(codec: &str, bytes: &[u8]) -> Result<Vec<u8>, BrokerError> {
    match codec {
        CODEC_NONE => Ok(bytes.to_vec()),
        CODEC_LZ4 => lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| BrokerError::Codec(format!("lz4: {}", e))),
        other => Err(BrokerError::Codec(format!("unknown codec '{}'", other))),
    }
}

/// JSON body of a notification message.
pub fn encode_message(message: &NotificationMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

pub fn decode_message(bytes: &[u8]) -> Result<NotificationMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_restores_value() {
        let value = br#"{"message":"Keep your 12-day streak alive!"}"#.repeat(20);
        let (codec, stored) = compress(&value, Compression::Lz4);
        assert_eq!(codec, CODEC_LZ4);
        assert!(stored.len() < value.len());
        assert_eq!(decompress(codec, &stored).unwrap(), value);
    }

    #[test]
    fn test_uncompressed_passthrough() {
        let (codec, stored) = compress(b"plain", Compression::None);
        assert_eq!(codec, CODEC_NONE);
        assert_eq!(stored, b"plain");
    }

    #[test]
    fn test_unknown_codec_rejected() {
        assert!(matches!(
            decompress("zstd", b"x"),
            Err(BrokerError::Codec(_))
        ));
        assert!(decompress(CODEC_LZ4, b"\x01").is_err());
    }

    #[test]
    fn test_malformed_message_fails_decode() {
        assert!(decode_message(b"{not json").is_err());
        assert!(decode_message(br#"{"id":"x"}"#).is_err());
    }
}
