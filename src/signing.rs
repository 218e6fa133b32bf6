//! Shared-key signing used by the Azure collaborators.
//!
//! Both Blob Storage SharedKey authorization and IoT Hub SAS tokens are
//! base64(HMAC-SHA256(base64-decoded key, string-to-sign)).

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Decoded account/device key. Wiped on drop.
#[derive(Clone)]
pub(crate) struct SharedKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SharedKey {
    pub(crate) fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("shared key is not valid base64")?;
        if bytes.is_empty() {
            return Err(anyhow!("shared key is empty"));
        }
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    pub(crate) fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.bytes)
            .map_err(|e| anyhow!("invalid hmac key: {}", e))?;
        mac.update(message.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Form-style percent encoding (`/` and `=` are escaped).
pub(crate) fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Split `Key=Value;Key=Value` connection strings. Values may contain `=`.
pub(crate) fn parse_key_value_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(index, part)| {
            // The segment itself may be a secret; report its position only.
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed connection string segment #{}", index + 1))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
