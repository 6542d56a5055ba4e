use crate::{
    LedgerError,
    Result,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};

pub(crate) const KEY_SEPARATOR: u8 = b'|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Gold,
    Essence,
    Tenure,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] =
        [ResourceKind::Gold, ResourceKind::Essence, ResourceKind::Tenure];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Gold => "gold",
            ResourceKind::Essence => "essence",
            ResourceKind::Tenure => "tenure",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gold" => Ok(ResourceKind::Gold),
            "essence" => Ok(ResourceKind::Essence),
            "tenure" => Ok(ResourceKind::Tenure),
            _ => Err(LedgerError::UnknownResource(raw.to_string())),
        }
    }
}

const WALLET_PREFIXES: [&str; 4] = ["stake1", "stake_test1", "addr1", "addr_test1"];

/// Canonical Cardano wallet identity.
///
/// Every ledger, snapshot and reconciliation record is keyed by the
/// lower-case bech32 text form. Other encodings (hex bytes, mixed case
/// variants) are rejected instead of being mapped, so one owner can never
/// end up with two ledgers through encoding differences.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason| LedgerError::InvalidWallet {
            raw: raw.to_string(),
            reason,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty address"));
        }
        // bech32 is case-insensitive but must not mix cases
        let has_upper = trimmed.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = trimmed.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower {
            return Err(invalid("mixed-case address"));
        }
        let canonical = trimmed.to_ascii_lowercase();
        let Some(prefix) = WALLET_PREFIXES
            .iter()
            .find(|prefix| canonical.starts_with(**prefix))
        else {
            return Err(invalid("expected a stake1/addr1 bech32 address"));
        };
        let data = &canonical[prefix.len()..];
        if data.is_empty() || !data.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("address payload is not bech32 text"));
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_stake_address(&self) -> bool {
        self.0.starts_with("stake")
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

impl FromStr for WalletAddress {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

/// On-chain asset unit: policy id followed by the hex asset name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.bytes().any(|b| b == KEY_SEPARATOR) {
            return Err(LedgerError::InvalidAsset(raw));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AssetId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AssetId> for String {
    fn from(value: AssetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub wallet: WalletAddress,
    pub resource: ResourceKind,
}

impl LedgerKey {
    pub fn new(wallet: WalletAddress, resource: ResourceKind) -> Self {
        Self { wallet, resource }
    }

    /// `wallet|resource`, the sort order of which groups all of a wallet's
    /// ledgers together.
    pub fn storage_key(&self) -> Vec<u8> {
        format!("{}|{}", self.wallet, self.resource).into_bytes()
    }

    /// Prefix shared by every audit record of this ledger.
    pub fn record_prefix(&self) -> Vec<u8> {
        let mut prefix = self.storage_key();
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    pub fn from_storage_key(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| anyhow::anyhow!("ledger key is not valid UTF-8"))?;
        let (wallet, resource) = text
            .split_once('|')
            .ok_or_else(|| anyhow::anyhow!("malformed ledger key: {text}"))?;
        Ok(Self {
            wallet: WalletAddress::parse(wallet)?,
            resource: resource.parse()?,
        })
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.wallet, self.resource)
    }
}

/// Start of the key range holding every ledger of `wallet`, and the
/// exclusive position right after it.
pub(crate) fn wallet_key_bounds(wallet: &WalletAddress) -> (Vec<u8>, Vec<u8>) {
    let mut start = wallet.as_str().as_bytes().to_vec();
    start.push(KEY_SEPARATOR);
    let mut end = start.clone();
    end.push(0x7f);
    (start, end)
}
