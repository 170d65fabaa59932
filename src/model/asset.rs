use std::fmt;

/// Asset locked in an escrow: the chain's native coin or a token contract
/// (ERC-20 address on EVM chains, jetton master address on TON).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Asset {
    Native,
    Token(String),
}

const EVM_ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

impl Asset {
    /// Orders name the native coin as `native`, an empty string or the EVM zero address.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("native")
            || trimmed.eq_ignore_ascii_case(EVM_ZERO_ADDRESS)
        {
            Asset::Native
        } else {
            Asset::Token(trimmed.to_string())
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => f.write_str("native"),
            Asset::Token(address) => f.write_str(address),
        }
    }
}
