//! Compact text form of a session description for copy/paste exchange:
//! JSON → gzip → base64.

use crate::error::{Error, Result};
use crate::peer::types::{Description, SdpPayload};
use crate::utils::random_id;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Ограничение на размер распакованных данных (защита от zip-bomb)
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

impl SdpPayload {
    pub fn new(sdp: Description) -> Self {
        Self {
            sdp,
            id: random_id(),
            ts: chrono::Utc::now().timestamp(),
        }
    }
}

pub fn encode(p: &SdpPayload) -> Result<String> {
    // 1. JSON -> bytes
    let json = serde_json::to_vec(p)?;

    // 2. GZIP compress
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;

    // 3. base64
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode(s: &str) -> Result<SdpPayload> {
    let compressed = general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| Error::Codec(format!("invalid base64: {e}")))?;

    let mut json = Vec::new();
    let mut limited = GzDecoder::new(&compressed[..]).take(MAX_DECOMPRESSED_SIZE + 1);
    limited
        .read_to_end(&mut json)
        .map_err(|e| Error::Codec(format!("invalid gzip stream: {e}")))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(Error::Codec(format!(
            "payload exceeds {MAX_DECOMPRESSED_SIZE} bytes"
        )));
    }

    serde_json::from_slice(&json).map_err(|e| Error::Codec(format!("invalid payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_keeps_description() {
        let payload = SdpPayload::new(Description::offer("v=0\r\ns=-\r\n"));
        let text = encode(&payload).unwrap();
        assert!(!text.contains('{'));

        let back = decode(&text).unwrap();
        assert_eq!(back.sdp, payload.sdp);
        assert_eq!(back.id, payload.id);
        assert_eq!(back.ts, payload.ts);
    }

    #[test]
    fn test_garbage_is_codec_error() {
        assert!(matches!(decode("%%%not base64%%%"), Err(Error::Codec(_))));
        let not_gzip = general_purpose::STANDARD.encode(b"plain bytes");
        assert!(matches!(decode(&not_gzip), Err(Error::Codec(_))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let huge = "a".repeat(MAX_DECOMPRESSED_SIZE as usize + 10);
        let payload = SdpPayload::new(Description::offer(huge));
        let text = encode(&payload).unwrap();
        assert!(matches!(decode(&text), Err(Error::Codec(_))));
    }
}
