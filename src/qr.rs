//! EMVCo / PromptPay QR codec (C1).
//!
//! Decodes the flat TLV stream EMVCo-style payment QR codes carry, recognizes
//! the PromptPay Application Identifier in the merchant-account-info sub-field,
//! and checks the trailing CRC-16/CCITT-FALSE. Parsing and serialization are
//! pure, synchronous functions with no I/O.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{BridgeError, BridgeResult};

const PROMPTPAY_AID: &str = "A000000677010111";
const MERCHANT_ACCOUNT_INFO_TAGS: [&str; 2] = ["29", "30"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Phone,
    NationalId,
}

/// A parsed PromptPay payload. `isValid` reflects CRC agreement only; a
/// structurally sound payload with a mismatched CRC still parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayData {
    pub account_id: String,
    pub account_type: AccountType,
    pub merchant_name: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub country: String,
    pub raw_payload: String,
    pub is_valid: bool,
}

/// Computes CRC-16/CCITT-FALSE: polynomial `0x1021`, initial value `0xFFFF`,
/// no input/output reflection, no final XOR.
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Parses a flat `TT LL VV…` TLV stream over UTF-8 byte offsets (tag and
/// length are two ASCII-decimal digits each; `length` counts value bytes).
fn parse_tlv(s: &str) -> BridgeResult<Vec<(String, String)>> {
    let bytes = s.as_bytes();
    let mut i = 0usize;
    let mut records = Vec::new();
    while i < bytes.len() {
        if i + 4 > bytes.len() {
            return Err(BridgeError::InvalidFormat("truncated tag/length header".into()));
        }
        let tag = std::str::from_utf8(&bytes[i..i + 2])
            .map_err(|_| BridgeError::InvalidFormat("non-UTF8 tag".into()))?
            .to_string();
        let len_str = std::str::from_utf8(&bytes[i + 2..i + 4])
            .map_err(|_| BridgeError::InvalidFormat("non-UTF8 length".into()))?;
        let len: usize = len_str
            .parse()
            .map_err(|_| BridgeError::InvalidFormat(format!("non-decimal length {len_str:?}")))?;
        i += 4;
        if i + len > bytes.len() {
            return Err(BridgeError::InvalidFormat("TLV value overruns payload".into()));
        }
        let value = std::str::from_utf8(&bytes[i..i + len])
            .map_err(|_| BridgeError::InvalidFormat("non-UTF8 value".into()))?
            .to_string();
        i += len;
        records.push((tag, value));
    }
    Ok(records)
}

fn find<'a>(records: &'a [(String, String)], tag: &str) -> Option<&'a str> {
    records
        .iter()
        .find(|(t, _)| t == tag)
        .map(|(_, v)| v.as_str())
}

/// Normalizes a PromptPay account identifier per §4.1: strips a `"00"`
/// country-prefixed form down to its 4-character header, then classifies by
/// resulting length.
fn normalize_account_id(raw: &str) -> BridgeResult<(String, AccountType)> {
    let stripped = if raw.starts_with("00") && raw.len() > 4 {
        &raw[4..]
    } else {
        raw
    };
    match stripped.len() {
        13 => Ok((stripped.to_string(), AccountType::NationalId)),
        10 => Ok((stripped.to_string(), AccountType::Phone)),
        9 => Ok((format!("0{stripped}"), AccountType::Phone)),
        other => Err(BridgeError::InvalidAccountId(format!(
            "normalized identifier has unsupported length {other}"
        ))),
    }
}

/// Parses a PromptPay QR payload string. Whitespace is stripped before
/// decoding; inputs shorter than 20 characters are rejected outright.
pub fn parse(input: &str) -> BridgeResult<PromptPayData> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() < 20 {
        return Err(BridgeError::InvalidFormat("payload shorter than 20 characters".into()));
    }

    let records = parse_tlv(&cleaned)?;

    let merchant_field = MERCHANT_ACCOUNT_INFO_TAGS
        .iter()
        .find_map(|tag| find(&records, tag))
        .ok_or_else(|| BridgeError::InvalidFormat("missing merchant account info field".into()))?;
    let sub_records = parse_tlv(merchant_field)?;

    let aid = find(&sub_records, "00").unwrap_or("");
    if aid != PROMPTPAY_AID {
        return Err(BridgeError::NotPromptPay);
    }

    let raw_identifier = find(&sub_records, "01")
        .or_else(|| find(&sub_records, "02"))
        .ok_or_else(|| BridgeError::InvalidAccountId("no account identifier sub-field".into()))?;
    let (account_id, account_type) = normalize_account_id(raw_identifier)?;

    let currency = find(&records, "53").unwrap_or("764").to_string();
    let country = find(&records, "58").unwrap_or("TH").to_string();
    let merchant_name = find(&records, "59").map(|s| s.to_string());
    let amount = find(&records, "54")
        .map(Decimal::from_str)
        .transpose()
        .map_err(|_| BridgeError::InvalidFormat("amount is not decimal".into()))?;

    let crc_field = find(&records, "63");
    let is_valid = match crc_field {
        Some(trailing) if cleaned.len() >= 4 => {
            let (body, tail) = cleaned.split_at(cleaned.len() - 4);
            let computed = crc16_ccitt_false(body.as_bytes());
            let computed_hex = format!("{computed:04X}");
            tail.eq_ignore_ascii_case(&computed_hex) && trailing.len() == 4
        }
        _ => false,
    };

    Ok(PromptPayData {
        account_id,
        account_type,
        merchant_name,
        amount,
        currency,
        country,
        raw_payload: cleaned,
        is_valid,
    })
}

/// Builds a TLV record: two-digit tag, two-digit zero-padded ASCII-decimal
/// length, then the value bytes.
fn tlv(tag: &str, value: &str) -> String {
    format!("{tag}{:02}{value}", value.len())
}

/// Generates a PromptPay payload for `accountId` (9/10-digit phone or
/// 13-digit national ID) and an optional THB amount, appending a correct
/// CRC-16/CCITT-FALSE trailer.
pub fn generate(account_id: &str, amount: Option<Decimal>) -> BridgeResult<String> {
    let (sub_tag, sub_value) = match account_id.len() {
        9 | 10 => {
            let digits = account_id.strip_prefix('0').unwrap_or(account_id);
            ("01", format!("0066{digits}"))
        }
        13 => ("02", format!("00TH{account_id}")),
        other => {
            return Err(BridgeError::InvalidAccountId(format!(
                "account id length {other} is not 9, 10, or 13"
            )));
        }
    };

    let mut payload = String::new();
    payload.push_str(&tlv("00", "01"));
    payload.push_str(&tlv("01", if amount.is_some() { "12" } else { "11" }));

    let sub_tlv = format!("{}{}", tlv("00", PROMPTPAY_AID), tlv(sub_tag, &sub_value));
    payload.push_str(&tlv("29", &sub_tlv));

    payload.push_str(&tlv("53", "764"));
    if let Some(amount) = amount {
        payload.push_str(&tlv("54", &format!("{:.2}", amount)));
    }
    payload.push_str(&tlv("58", "TH"));
    payload.push_str("6304");

    let crc = crc16_ccitt_false(payload.as_bytes());
    payload.push_str(&format!("{crc:04X}"));
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_trip_phone_static_amount() {
        let payload = generate("0812345678", Some(dec!(150.00))).unwrap();
        let parsed = parse(&payload).unwrap();
        assert_eq!(parsed.account_id, "0812345678");
        assert_eq!(parsed.account_type, AccountType::Phone);
        assert_eq!(parsed.amount, Some(dec!(150.00)));
        assert!(parsed.is_valid);
    }

    #[test]
    fn round_trip_national_id_no_amount() {
        let payload = generate("1234567890123", None).unwrap();
        let parsed = parse(&payload).unwrap();
        assert_eq!(parsed.account_id, "1234567890123");
        assert_eq!(parsed.account_type, AccountType::NationalId);
        assert_eq!(parsed.amount, None);
        assert!(parsed.is_valid);
    }

    #[test]
    fn round_trip_nine_digit_phone_gets_leading_zero() {
        let payload = generate("812345678", None).unwrap();
        let parsed = parse(&payload).unwrap();
        assert_eq!(parsed.account_id, "0812345678");
        assert_eq!(parsed.account_type, AccountType::Phone);
    }

    #[test]
    fn crc_tampering_flips_validity_not_structure() {
        let payload = generate("0812345678", Some(dec!(150.00))).unwrap();
        let mut tampered: Vec<char> = payload.chars().collect();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == '0' { '1' } else { '0' };
        let tampered: String = tampered.into_iter().collect();

        let parsed = parse(&tampered).unwrap();
        assert!(!parsed.is_valid);
    }

    #[test]
    fn rejects_non_promptpay_aid() {
        let mut payload = generate("0812345678", None).unwrap();
        payload = payload.replace("A000000677010111", "A000000677010199");
        let err = parse(&payload).unwrap_err();
        assert!(matches!(err, BridgeError::NotPromptPay));
    }

    #[test]
    fn rejects_short_input() {
        let err = parse("000201").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidFormat(_)));
    }

    #[test]
    fn rejects_bad_account_id_length() {
        let err = generate("12345", None).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAccountId(_)));
    }

    #[test]
    fn crc_of_empty_body_is_the_init_value() {
        assert_eq!(crc16_ccitt_false(b""), 0xFFFF);
    }
}
