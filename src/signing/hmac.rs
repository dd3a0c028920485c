use crate::error::{AdapterError, Result};
use crate::transport::AuthArgs;
use ::hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha384;

use super::nonce::MonotonicMillis;

type HmacSha384 = Hmac<Sha384>;

/// API credentials for socket authentication
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: String, secret: String) -> Self {
        Self { api_key, secret }
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Builds signed `auth` packets for the socket API
#[derive(Debug)]
pub struct HmacAuth {
    credentials: ApiCredentials,
    nonces: MonotonicMillis,
}

impl HmacAuth {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            credentials,
            nonces: MonotonicMillis::new(),
        }
    }

    /// Hex encoded HMAC-SHA384 signature
    fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha384::new_from_slice(self.credentials.secret.as_bytes())
            .map_err(|e| AdapterError::Signature(format!("HMAC init failed: {}", e)))?;

        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Message the venue expects to be signed
    fn build_payload(nonce: u64) -> String {
        format!("AUTH{}", nonce)
    }

    /// Build the `auth` event, merging in dead man switch and extra auth args
    pub fn build_auth_packet(&self, args: &AuthArgs) -> Result<Value> {
        let nonce = self.nonces.next();
        let payload = Self::build_payload(nonce);
        let signature = self.sign(&payload)?;

        tracing::debug!("Signing socket auth payload with nonce {}", nonce);

        let mut packet = Map::new();
        packet.insert("event".to_string(), json!("auth"));
        packet.insert("apiKey".to_string(), json!(self.credentials.api_key));
        packet.insert("authSig".to_string(), json!(signature));
        packet.insert("authNonce".to_string(), json!(nonce));
        packet.insert("authPayload".to_string(), json!(payload));
        if let Some(dms) = args.dms {
            packet.insert("dms".to_string(), json!(dms));
        }
        for (key, value) in &args.extra {
            packet.insert(key.clone(), value.clone());
        }

        Ok(Value::Object(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> HmacAuth {
        HmacAuth::new(ApiCredentials::new(
            "test-key".to_string(),
            "test-secret".to_string(),
        ))
    }

    #[test]
    fn test_build_payload() {
        assert_eq!(HmacAuth::build_payload(1704067200000), "AUTH1704067200000");
    }

    #[test]
    fn test_sign_is_hex_sha384() {
        let sig = auth().sign("AUTH1").unwrap();
        // 48 byte digest, hex encoded
        assert_eq!(sig.len(), 96);
        assert!(hex::decode(&sig).is_ok());
        assert_eq!(sig, auth().sign("AUTH1").unwrap());
    }

    #[test]
    fn test_auth_packet_fields() {
        let args = AuthArgs {
            dms: Some(4),
            extra: Map::new(),
        };
        let packet = auth().build_auth_packet(&args).unwrap();

        assert_eq!(packet["event"], "auth");
        assert_eq!(packet["apiKey"], "test-key");
        assert_eq!(packet["dms"], 4);
        let nonce = packet["authNonce"].as_u64().unwrap();
        assert_eq!(packet["authPayload"], format!("AUTH{}", nonce));
    }

    #[test]
    fn test_nonces_increase_between_packets() {
        let auth = auth();
        let a = auth.build_auth_packet(&AuthArgs::default()).unwrap();
        let b = auth.build_auth_packet(&AuthArgs::default()).unwrap();
        assert!(b["authNonce"].as_u64() > a["authNonce"].as_u64());
        assert!(a.get("dms").is_none());
    }
}
