//! Small shared value types used across the codec, quote, order, and queue layers.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::BridgeError;

/// Supported settlement tokens. Fixed set per the rate table and fee table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Token {
    Usdt,
    Usdc,
    Eth,
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Token::Usdt => "USDT",
            Token::Usdc => "USDC",
            Token::Eth => "ETH",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Token {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USDT" => Ok(Token::Usdt),
            "USDC" => Ok(Token::Usdc),
            "ETH" => Ok(Token::Eth),
            other => Err(BridgeError::InvalidFormat(format!("unknown token {other}"))),
        }
    }
}

/// `ISO-4217` numeric currency code. Only THB (`"764"`) is produced by this
/// bridge, but the QR codec carries whatever the payload declares.
pub type CurrencyCode = String;
