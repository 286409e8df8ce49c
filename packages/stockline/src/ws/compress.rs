//! Application-level payload compression.
//!
//! Decided per outgoing message, per recipient: only when the recipient
//! declared `supportsCompression` and the serialized payload clears the
//! size threshold. Below it, the lz4 call costs more than it saves, so
//! small payloads always go plain. Independent of any transport-level
//! permessage-deflate the socket may have negotiated.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::protocol::ProtocolError;

/// Serialized-payload size above which compression pays off.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Compress `bytes` when they exceed `threshold`.
///
/// Returns the base64 wire form, or `None` when the payload is small
/// enough to send as-is. The lz4 block carries its uncompressed size so
/// the receiver needs no out-of-band hint.
pub fn maybe_compress(bytes: &[u8], threshold: usize) -> std::io::Result<Option<String>> {
    if bytes.len() <= threshold {
        return Ok(None);
    }
    let block = lz4::block::compress(bytes, None, true)?;
    Ok(Some(BASE64.encode(block)))
}

/// Reverse of [`maybe_compress`]: base64 → lz4 block → raw payload bytes.
pub fn decode(blob: &str) -> Result<Vec<u8>, ProtocolError> {
    let block = BASE64.decode(blob).map_err(ProtocolError::BadCompressedEncoding)?;
    lz4::block::decompress(&block, None).map_err(ProtocolError::Decompress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_threshold_stays_plain() {
        let bytes = vec![b'a'; 1024];
        assert!(maybe_compress(&bytes, DEFAULT_COMPRESSION_THRESHOLD).unwrap().is_none());
    }

    #[test]
    fn one_past_threshold_compresses() {
        let bytes = vec![b'a'; 1025];
        let blob = maybe_compress(&bytes, DEFAULT_COMPRESSION_THRESHOLD).unwrap().unwrap();
        assert_eq!(decode(&blob).unwrap(), bytes);
        // Repetitive input should actually shrink on the wire.
        assert!(blob.len() < bytes.len());
    }

    #[test]
    fn roundtrip_preserves_arbitrary_json_bytes() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "rows": (0..200).collect::<Vec<u32>>(),
            "note": "snapshot"
        }))
        .unwrap();
        let blob = maybe_compress(&bytes, 16).unwrap().unwrap();
        assert_eq!(decode(&blob).unwrap(), bytes);
    }

    #[test]
    fn garbage_base64_rejected() {
        assert!(matches!(decode("!!!"), Err(ProtocolError::BadCompressedEncoding(_))));
    }

    #[test]
    fn truncated_block_rejected() {
        let blob = maybe_compress(&vec![b'z'; 4096], 16).unwrap().unwrap();
        let block = BASE64.decode(&blob).unwrap();
        let truncated = BASE64.encode(&block[..block.len() / 2]);
        assert!(matches!(decode(&truncated), Err(ProtocolError::Decompress(_))));
    }
}
