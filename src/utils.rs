//utils for graceful shutdown and payload encoding that can be used on
//any module in the project
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let tc = token.clone();
    //spawn once to listen for ctrl-c
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => error!("failed to install ctrl-c handler: {e}"),
        }
        tc.cancel();
    });
    token
}

/// Serde adapter for opaque byte blobs (signed order payloads).
///
/// Human-readable formats (JSON) carry the bytes as URL-safe base64; binary
/// formats (bincode) carry them as raw bytes.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
    use serde::{Deserialize, Deserializer, Serializer, de};
    use serde_bytes::ByteBuf;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&B64.encode(bytes))
        } else {
            serde_bytes::serialize(bytes, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            B64.decode(s.as_bytes()).map_err(de::Error::custom)
        } else {
            ByteBuf::deserialize(deserializer).map(ByteBuf::into_vec)
        }
    }
}
