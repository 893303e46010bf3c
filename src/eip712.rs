//! EIP-712 typed-data offline-authorization codec (C2).
//!
//! Domain-separated hashing, sign/verify, and the compact QR envelope used to
//! carry a pre-signed transfer authorization when the device that produced it
//! was offline at signing time.

use alloy_primitives::{Address, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{BridgeError, BridgeResult};
use crate::timestamp::UnixTimestamp;

pub const CHAIN_ID: u64 = 56; // BSC

sol! {
    #[derive(Debug)]
    struct Payment {
        string orderId;
        string token;
        uint256 amount;
        address recipient;
        uint256 nonce;
        uint256 deadline;
    }
}

/// Builds the `BoonLink Payment` EIP-712 domain. `verifying_contract` defaults
/// to the zero address when the deployment has none configured.
pub fn domain(verifying_contract: Option<Address>) -> Eip712Domain {
    eip712_domain! {
        name: "BoonLink Payment",
        version: "1",
        chain_id: CHAIN_ID,
        verifying_contract: verifying_contract.unwrap_or_default(),
    }
}

/// An offline payment authorization prior to signing.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflinePaymentAuthorization {
    pub order_id: String,
    pub token: String,
    pub amount: U256,
    pub recipient: Address,
    pub nonce: u64,
    pub deadline: UnixTimestamp,
}

impl OfflinePaymentAuthorization {
    fn as_sol_struct(&self) -> Payment {
        Payment {
            orderId: self.order_id.clone(),
            token: self.token.clone(),
            amount: self.amount,
            recipient: self.recipient,
            nonce: U256::from(self.nonce),
            deadline: U256::from(self.deadline),
        }
    }

    /// `keccak256(0x1901 ‖ domainSeparator ‖ structHash)`.
    pub fn digest(&self, domain: &Eip712Domain) -> alloy_primitives::B256 {
        self.as_sol_struct().eip712_signing_hash(domain)
    }
}

/// Signs `auth` under `domain`, returning the 65-byte `(r, s, v)` signature as
/// `0x`-prefixed hex.
pub async fn sign(
    signer: &PrivateKeySigner,
    auth: &OfflinePaymentAuthorization,
    domain: &Eip712Domain,
) -> BridgeResult<String> {
    let digest = auth.digest(domain);
    let signature = signer
        .sign_hash(&digest)
        .await
        .map_err(|e| BridgeError::Internal(format!("signing failed: {e}")))?;
    Ok(format!("0x{}", hex::encode(signature.as_bytes())))
}

/// Outcome of verifying an offline authorization. Mirrors §4.2: verification
/// never throws, it reports `valid = false` with the recovered address (if
/// any) and a reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub signer: Option<Address>,
    pub error: Option<String>,
}

/// Verifies `signature_hex` over `auth` under `domain`, requiring the
/// recovered signer to case-insensitively match `claimed_signer` and the
/// deadline to not have passed `now`.
pub fn verify(
    auth: &OfflinePaymentAuthorization,
    domain: &Eip712Domain,
    signature_hex: &str,
    claimed_signer: Address,
    now: UnixTimestamp,
) -> VerifyOutcome {
    let raw = match signature_hex.strip_prefix("0x").unwrap_or(signature_hex).parse::<HexBytes>() {
        Ok(bytes) => bytes.0,
        Err(e) => {
            return VerifyOutcome {
                valid: false,
                signer: None,
                error: Some(e),
            };
        }
    };
    let sig_array: [u8; 65] = match raw.try_into() {
        Ok(arr) => arr,
        Err(_) => {
            return VerifyOutcome {
                valid: false,
                signer: None,
                error: Some("signature must be 65 bytes".to_string()),
            };
        }
    };
    let signature = match alloy_primitives::Signature::from_raw_array(&sig_array) {
        Ok(s) => s,
        Err(e) => {
            return VerifyOutcome {
                valid: false,
                signer: None,
                error: Some(format!("malformed signature: {e}")),
            };
        }
    };

    let digest = auth.digest(domain);
    let recovered = match signature.recover_address_from_prehash(&digest) {
        Ok(addr) => addr,
        Err(e) => {
            return VerifyOutcome {
                valid: false,
                signer: None,
                error: Some(format!("recovery failed: {e}")),
            };
        }
    };

    if auth.deadline.seconds_since_epoch() < now.seconds_since_epoch() {
        return VerifyOutcome {
            valid: false,
            signer: Some(recovered),
            error: Some("signature expired".to_string()),
        };
    }

    if recovered != claimed_signer {
        return VerifyOutcome {
            valid: false,
            signer: Some(recovered),
            error: Some("recovered address does not match claimed signer".to_string()),
        };
    }

    VerifyOutcome {
        valid: true,
        signer: Some(recovered),
        error: None,
    }
}

struct HexBytes(Vec<u8>);

impl FromStr for HexBytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(HexBytes).map_err(|e| format!("invalid hex: {e}"))
    }
}

/// Compact QR envelope mapping: `{o,t,a,r,n,d,s,f}` ↔
/// `{orderId,token,amount,recipient,nonce,deadline,signature,signer}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    o: String,
    t: String,
    a: String,
    r: String,
    n: String,
    d: String,
    s: String,
    f: String,
}

/// Base64-encodes the compact envelope for `auth`, `signature_hex`, and `signer`.
pub fn encode_envelope(auth: &OfflinePaymentAuthorization, signature_hex: &str, signer: Address) -> String {
    let envelope = Envelope {
        o: auth.order_id.clone(),
        t: auth.token.clone(),
        a: auth.amount.to_string(),
        r: format!("{recipient:#x}", recipient = auth.recipient),
        n: auth.nonce.to_string(),
        d: auth.deadline.seconds_since_epoch().to_string(),
        s: signature_hex.to_string(),
        f: format!("{signer:#x}"),
    };
    let json = serde_json::to_vec(&envelope).expect("envelope always serializes");
    crate::util::b64::Base64Bytes::encode(json).to_string()
}

/// Decodes a base64 QR envelope back into its authorization, signature, and
/// claimed signer. Rejects non-base64 input, missing fields, and non-decimal
/// numeric fields.
pub fn decode_envelope(encoded: &str) -> BridgeResult<(OfflinePaymentAuthorization, String, Address)> {
    let bytes = crate::util::b64::Base64Bytes::from(encoded.as_bytes())
        .decode()
        .map_err(|e| BridgeError::InvalidFormat(format!("envelope is not valid base64: {e}")))?;
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .map_err(|e| BridgeError::InvalidFormat(format!("envelope is missing a field: {e}")))?;

    let amount = U256::from_str_radix(&envelope.a, 10)
        .map_err(|_| BridgeError::InvalidFormat("amount is not decimal".to_string()))?;
    let nonce = envelope
        .n
        .parse::<u64>()
        .map_err(|_| BridgeError::InvalidFormat("nonce is not decimal".to_string()))?;
    let deadline_secs = envelope
        .d
        .parse::<u64>()
        .map_err(|_| BridgeError::InvalidFormat("deadline is not decimal".to_string()))?;
    let recipient = Address::from_str(&envelope.r)
        .map_err(|e| BridgeError::InvalidFormat(format!("recipient is not an address: {e}")))?;
    let signer = Address::from_str(&envelope.f)
        .map_err(|e| BridgeError::InvalidFormat(format!("signer is not an address: {e}")))?;

    let auth = OfflinePaymentAuthorization {
        order_id: envelope.o,
        token: envelope.t,
        amount,
        recipient,
        nonce,
        deadline: UnixTimestamp(deadline_secs),
    };
    Ok((auth, envelope.s, signer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_auth(recipient: Address, deadline: u64) -> OfflinePaymentAuthorization {
        OfflinePaymentAuthorization {
            order_id: "order-1".to_string(),
            token: "USDT".to_string(),
            amount: U256::from(4_408_000u64),
            recipient,
            nonce: 1,
            deadline: UnixTimestamp(deadline),
        }
    }

    #[tokio::test]
    async fn sign_then_verify_round_trips() {
        let signer = PrivateKeySigner::random();
        let domain = domain(None);
        let auth = sample_auth(Address::ZERO, UnixTimestamp::try_now().unwrap().seconds_since_epoch() + 3600);

        let signature = sign(&signer, &auth, &domain).await.unwrap();
        let outcome = verify(&auth, &domain, &signature, signer.address(), UnixTimestamp::try_now().unwrap());

        assert!(outcome.valid);
        assert_eq!(outcome.signer, Some(signer.address()));
    }

    #[tokio::test]
    async fn verify_rejects_expired_deadline() {
        let signer = PrivateKeySigner::random();
        let domain = domain(None);
        let auth = sample_auth(Address::ZERO, 1);

        let signature = sign(&signer, &auth, &domain).await.unwrap();
        let outcome = verify(&auth, &domain, &signature, signer.address(), UnixTimestamp(2));

        assert!(!outcome.valid);
    }

    #[tokio::test]
    async fn verify_rejects_wrong_claimed_signer() {
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let domain = domain(None);
        let auth = sample_auth(Address::ZERO, UnixTimestamp::try_now().unwrap().seconds_since_epoch() + 3600);

        let signature = sign(&signer, &auth, &domain).await.unwrap();
        let outcome = verify(&auth, &domain, &signature, other.address(), UnixTimestamp::try_now().unwrap());

        assert!(!outcome.valid);
    }

    #[test]
    fn envelope_round_trips() {
        let signer = Address::ZERO;
        let auth = sample_auth(Address::ZERO, 9_999_999_999);
        let encoded = encode_envelope(&auth, "0xdeadbeef", signer);
        let (decoded, sig, decoded_signer) = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded.order_id, auth.order_id);
        assert_eq!(sig, "0xdeadbeef");
        assert_eq!(decoded_signer, signer);
    }

    #[test]
    fn envelope_rejects_non_base64() {
        let err = decode_envelope("not base64!!").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidFormat(_)));
    }

    #[test]
    fn envelope_rejects_non_decimal_amount() {
        let envelope = Envelope {
            o: "order-1".to_string(),
            t: "USDT".to_string(),
            a: "not-a-number".to_string(),
            r: format!("{:#x}", Address::ZERO),
            n: "1".to_string(),
            d: "1".to_string(),
            s: "0xdeadbeef".to_string(),
            f: format!("{:#x}", Address::ZERO),
        };
        let json = serde_json::to_vec(&envelope).unwrap();
        let encoded = crate::util::b64::Base64Bytes::encode(json).to_string();
        let err = decode_envelope(&encoded).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidFormat(_)));
    }
}
