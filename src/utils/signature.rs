use crate::core::error::GridError;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// 统一的签名辅助工具，覆盖当前支持的交易所
pub struct SignatureHelper;

impl SignatureHelper {
    /// Kraken 签名: Base64(HMAC-SHA512(path + SHA256(nonce + postdata)))
    /// 密钥为Base64编码的私钥
    pub fn kraken_signature(
        secret: &str,
        path: &str,
        nonce: &str,
        postdata: &str,
    ) -> Result<String, GridError> {
        let secret_bytes = general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| GridError::AuthError(format!("Kraken密钥不是合法Base64: {}", e)))?;

        let mut sha = Sha256::new();
        sha.update(nonce.as_bytes());
        sha.update(postdata.as_bytes());
        let digest = sha.finalize();

        let mut mac =
            HmacSha512::new_from_slice(&secret_bytes).expect("HMAC 支持任意长度密钥");
        mac.update(path.as_bytes());
        mac.update(&digest);
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Coinbase 签名: Base64(HMAC-SHA256(timestamp + method + path + body))
    /// 密钥为Base64编码的私钥
    pub fn coinbase_signature(
        secret: &str,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<String, GridError> {
        let secret_bytes = general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| GridError::AuthError(format!("Coinbase密钥不是合法Base64: {}", e)))?;

        let prehash = format!("{}{}{}{}", timestamp, method, request_path, body);
        let mut mac =
            HmacSha256::new_from_slice(&secret_bytes).expect("HMAC 支持任意长度密钥");
        mac.update(prehash.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// 毫秒级时间戳（Kraken nonce）
    pub fn timestamp() -> u64 {
        Utc::now().timestamp_millis() as u64
    }

    /// 秒级时间戳（Coinbase CB-ACCESS-TIMESTAMP）
    pub fn timestamp_seconds() -> u64 {
        Utc::now().timestamp() as u64
    }

    /// 统一的 URL 编码封装
    pub fn url_encode(value: &str) -> String {
        urlencoding::encode(value).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kraken_signature_deterministic() {
        let secret = general_purpose::STANDARD.encode(b"test-secret-key");
        let first = SignatureHelper::kraken_signature(
            &secret,
            "/0/private/AddOrder",
            "1616492376594",
            "nonce=1616492376594&pair=XBTUSD",
        )
        .unwrap();
        let second = SignatureHelper::kraken_signature(
            &secret,
            "/0/private/AddOrder",
            "1616492376594",
            "nonce=1616492376594&pair=XBTUSD",
        )
        .unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_kraken_signature_rejects_bad_secret() {
        let result =
            SignatureHelper::kraken_signature("not-base64!!!", "/0/private/AddOrder", "1", "x");
        assert!(matches!(result, Err(GridError::AuthError(_))));
    }

    #[test]
    fn test_coinbase_signature_varies_with_timestamp() {
        let secret = general_purpose::STANDARD.encode(b"another-secret");
        let first =
            SignatureHelper::coinbase_signature(&secret, "1000", "GET", "/orders", "").unwrap();
        let second =
            SignatureHelper::coinbase_signature(&secret, "1001", "GET", "/orders", "").unwrap();
        assert_ne!(first, second);
    }
}
