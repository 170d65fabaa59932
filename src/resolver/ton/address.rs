//! TON account addresses in raw (`wc:hex`) and user-friendly (base64) form

use crate::error::{SwapError, SwapResult};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use crc::{Crc, CRC_16_XMODEM};
use std::fmt;

const TAG_BOUNCEABLE: u8 = 0x11;
const TAG_NON_BOUNCEABLE: u8 = 0x51;
const TAG_TESTNET: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

/// CRC16/XMODEM checksum used by friendly addresses
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub(crate) fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

impl TonAddress {
    pub fn new(workchain: i8, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    /// Accepts `wc:hex` and 48-character friendly addresses in either base64 alphabet
    pub fn parse(value: &str) -> SwapResult<Self> {
        let value = value.trim();
        if value.contains(':') {
            Self::parse_raw(value)
        } else {
            Self::parse_friendly(value)
        }
    }

    fn parse_raw(value: &str) -> SwapResult<Self> {
        let invalid = |why: &str| SwapError::Validation(format!("invalid TON address {}: {}", value, why));

        let (wc, hash) = value.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        let workchain: i8 = wc.parse().map_err(|_| invalid("bad workchain"))?;
        let bytes = hex::decode(hash).map_err(|_| invalid("bad hex"))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| invalid("hash must be 32 bytes"))?;
        Ok(Self { workchain, hash })
    }

    fn parse_friendly(value: &str) -> SwapResult<Self> {
        let invalid = |why: &str| SwapError::Validation(format!("invalid TON address {}: {}", value, why));

        if value.len() != 48 {
            return Err(invalid("friendly form must be 48 characters"));
        }
        let bytes = if value.contains('-') || value.contains('_') {
            URL_SAFE.decode(value)
        } else {
            STANDARD.decode(value)
        }
        .map_err(|_| invalid("bad base64"))?;
        if bytes.len() != 36 {
            return Err(invalid("friendly form must decode to 36 bytes"));
        }

        let tag = bytes[0] & !TAG_TESTNET;
        if tag != TAG_BOUNCEABLE && tag != TAG_NON_BOUNCEABLE {
            return Err(invalid("unknown tag"));
        }
        let checksum = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != checksum {
            return Err(invalid("checksum mismatch"));
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: bytes[1] as i8,
            hash,
        })
    }

    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }

    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let mut tag = if bounceable {
            TAG_BOUNCEABLE
        } else {
            TAG_NON_BOUNCEABLE
        };
        if testnet {
            tag |= TAG_TESTNET;
        }

        let mut bytes = Vec::with_capacity(36);
        bytes.push(tag);
        bytes.push(self.workchain as u8);
        bytes.extend_from_slice(&self.hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        URL_SAFE.encode(bytes)
    }
}

impl fmt::Display for TonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}
