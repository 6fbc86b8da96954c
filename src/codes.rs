//! Redemption codes and scannable payloads
//!
//! Codes are what a family reads out or a business types in, so the
//! alphabet drops characters that are easy to confuse (`I`, `O`, `0`, `1`, `L`).
//! The payload is a display hint for QR rendering only. Verification always
//! checks stored redemption state and never trusts payload contents.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::RedemptionError;

/// 23 letters + 8 digits
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Significant characters in a code
pub const CODE_LENGTH: usize = 12;

/// Characters per hyphen-separated group
pub const CODE_GROUP: usize = 4;

/// Rendered length including hyphens
pub const FORMATTED_CODE_LENGTH: usize = CODE_LENGTH + CODE_LENGTH / CODE_GROUP - 1;

/// Generate a code of the form `ABCD-EFGH-JKMN` from the OS CSPRNG
pub fn generate_code() -> String {
    let mut rng = OsRng;
    let mut code = String::with_capacity(FORMATTED_CODE_LENGTH);
    for i in 0..CODE_LENGTH {
        if i > 0 && i % CODE_GROUP == 0 {
            code.push('-');
        }
        let idx = rng.gen_range(0..CODE_ALPHABET.len());
        code.push(CODE_ALPHABET[idx] as char);
    }
    code
}

/// Trim and upper-case user input before lookup
pub fn normalize_code(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

/// Shape check only; says nothing about whether the code exists
pub fn is_well_formed_code(code: &str) -> bool {
    if code.len() != FORMATTED_CODE_LENGTH {
        return false;
    }
    code.bytes().enumerate().all(|(i, b)| {
        if (i + 1) % (CODE_GROUP + 1) == 0 {
            b == b'-'
        } else {
            CODE_ALPHABET.contains(&b)
        }
    })
}

/// Short random hex suffix for record ids
pub fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fields carried in the QR payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub redemption_id: String,
    pub redemption_code: String,
    pub reward_id: String,
    pub business_id: String,
    pub user_id: String,
    pub points_spent: i64,
    pub timestamp: DateTime<Utc>,
}

/// Encode the payload as base64 JSON
pub fn generate_payload(payload: &QrPayload) -> Result<String, RedemptionError> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| RedemptionError::InvalidInput(format!("payload encoding failed: {}", e)))?;
    Ok(STANDARD.encode(json))
}

/// Decode a payload for display. Not an authentication step.
pub fn decode_payload(encoded: &str) -> Result<QrPayload, RedemptionError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| RedemptionError::InvalidInput(format!("payload is not base64: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RedemptionError::InvalidInput(format!("payload is not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn test_alphabet_excludes_ambiguous() {
        for c in [b'I', b'O', b'0', b'1', b'L'] {
            assert!(!CODE_ALPHABET.contains(&c), "alphabet contains {}", c as char);
        }
        let unique: HashSet<u8> = CODE_ALPHABET.iter().copied().collect();
        assert_eq!(unique.len(), CODE_ALPHABET.len());
    }

    #[test]
    fn test_code_format() {
        let code = generate_code();
        assert_eq!(code.len(), 14);
        assert_eq!(&code[4..5], "-");
        assert_eq!(&code[9..10], "-");
        assert!(is_well_formed_code(&code));
    }

    #[test]
    fn test_ten_thousand_codes_unique_and_unambiguous() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let code = generate_code();
            assert!(
                !code.contains(['I', 'O', '0', '1', 'L']),
                "ambiguous character in {}",
                code
            );
            assert!(seen.insert(code), "duplicate code generated");
        }
    }

    #[test]
    fn test_well_formed_rejects_bad_shapes() {
        assert!(!is_well_formed_code("ABCD-EFGH-JKM"));
        assert!(!is_well_formed_code("ABCDEFGHJKMNP2"));
        assert!(!is_well_formed_code("ABCD-EFGH-JKL0"));
        assert!(!is_well_formed_code("abcd-efgh-jkmn"));
        assert!(is_well_formed_code(&normalize_code(" abcd-efgh-jkmn ")));
    }

    #[test]
    fn test_payload_decodes_for_display() {
        let payload = QrPayload {
            redemption_id: "redeem-1-abcd".into(),
            redemption_code: "ABCD-EFGH-JKMN".into(),
            reward_id: "reward-1".into(),
            business_id: "biz-1".into(),
            user_id: "kid-1".into(),
            points_spent: 250,
            timestamp: Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
        };
        let encoded = generate_payload(&payload).unwrap();
        assert!(!encoded.contains("ABCD-EFGH-JKMN"));
        assert_eq!(decode_payload(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_decode_garbage_is_invalid_input() {
        assert!(matches!(
            decode_payload("not base64!!"),
            Err(RedemptionError::InvalidInput(_))
        ));
    }
}
