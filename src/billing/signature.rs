// src/billing/signature.rs
//
// Проверка подписи вебхука (заголовок Stripe-Signature, схема t=...,v1=...):
// HMAC-SHA256 от "{timestamp}.{body}", сравнение в константное время.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    MalformedHeader,
    TimestampTooOld,
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::MalformedHeader => write!(f, "malformed signature header"),
            SignatureError::TimestampTooOld => write!(f, "signature timestamp too old"),
            SignatureError::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

struct SignatureParts {
    timestamp: i64,
    signature: String,
}

fn parse_header(header: &str) -> Result<SignatureParts, SignatureError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(SignatureError::MalformedHeader);
        };
        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // другие версии схемы игнорируем
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(SignatureError::MalformedHeader)?,
        signature: signature.ok_or(SignatureError::MalformedHeader)?,
    })
}

fn compute_signature(secret: &str, payload: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(
    secret: &str,
    payload: &[u8],
    header: &str,
    now_epoch_secs: i64,
) -> Result<(), SignatureError> {
    let parts = parse_header(header)?;

    if (now_epoch_secs - parts.timestamp).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return Err(SignatureError::TimestampTooOld);
    }

    let signed_payload = format!("{}.{}", parts.timestamp, String::from_utf8_lossy(payload));
    let expected = compute_signature(secret, signed_payload.as_bytes());

    let expected_bytes = hex::decode(&expected).map_err(|_| SignatureError::Mismatch)?;
    let provided_bytes =
        hex::decode(&parts.signature).map_err(|_| SignatureError::MalformedHeader)?;

    if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
        return Err(SignatureError::Mismatch);
    }
    Ok(())
}

/// Формирует валидный заголовок — для тестов и локальной отладки.
pub fn sign_for_header(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    format!("t={},v1={}", timestamp, compute_signature(secret, signed_payload.as_bytes()))
}
