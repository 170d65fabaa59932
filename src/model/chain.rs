use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain families with a resolver implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Ton,
}

impl ChainFamily {
    /// Infer the family from the sign of a chain id.
    ///
    /// TON networks use negative global ids (-239 mainnet, -3 testnet); EVM
    /// chain ids are positive. Zero belongs to neither.
    pub fn from_chain_id(chain_id: i64) -> Option<Self> {
        match chain_id {
            id if id > 0 => Some(ChainFamily::Evm),
            id if id < 0 => Some(ChainFamily::Ton),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Ton => "ton",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_sign() {
        assert_eq!(ChainFamily::from_chain_id(1), Some(ChainFamily::Evm));
        assert_eq!(ChainFamily::from_chain_id(11155111), Some(ChainFamily::Evm));
        assert_eq!(ChainFamily::from_chain_id(-239), Some(ChainFamily::Ton));
        assert_eq!(ChainFamily::from_chain_id(-3), Some(ChainFamily::Ton));
        assert_eq!(ChainFamily::from_chain_id(0), None);
    }
}
