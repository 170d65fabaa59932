//! Wallet v4 signing
//!
//! Keys come either from a 24-word TON mnemonic or a raw 32-byte ed25519
//! seed. Transfers are signed wallet v4r2 external messages.

use super::address::TonAddress;
use super::cell::{Cell, CellBuilder};
use crate::error::{SwapError, SwapResult};

use ed25519_dalek::{Signer as _, SigningKey};
use ethers::types::U256;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use std::sync::Arc;
use zeroize::Zeroizing;

type HmacSha512 = Hmac<Sha512>;

/// Default wallet v4 subwallet id on workchain 0
pub const DEFAULT_SUBWALLET_ID: u32 = 698_983_191;

/// Send mode: pay fees separately and ignore action-phase errors
pub const SEND_MODE_PAY_FEES_SEPARATELY: u8 = 3;

const MNEMONIC_SALT: &[u8] = b"TON default seed";
const MNEMONIC_ITERATIONS: u32 = 100_000;

/// Derive the ed25519 key of a TON mnemonic without password
pub fn key_from_mnemonic(phrase: &str) -> SwapResult<SigningKey> {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    if words.len() != 24 {
        return Err(SwapError::Credential(format!(
            "TON mnemonic must have 24 words, got {}",
            words.len()
        )));
    }
    let normalized = Zeroizing::new(words.join(" "));

    let mut mac = HmacSha512::new_from_slice(normalized.as_bytes())
        .map_err(|e| SwapError::Credential(format!("hmac key: {}", e)))?;
    mac.update(b"");
    let mut entropy = Zeroizing::new([0u8; 64]);
    entropy.copy_from_slice(&mac.finalize().into_bytes());

    let mut seed = Zeroizing::new([0u8; 64]);
    pbkdf2_hmac::<Sha512>(&entropy[..], MNEMONIC_SALT, MNEMONIC_ITERATIONS, &mut seed[..]);
    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&seed[..32]);
    Ok(SigningKey::from_bytes(&secret))
}

/// Parse a hex-encoded 32-byte ed25519 seed
pub fn key_from_hex(value: &str) -> SwapResult<SigningKey> {
    let bytes = Zeroizing::new(
        hex::decode(value.trim().trim_start_matches("0x"))
            .map_err(|e| SwapError::Credential(format!("Invalid TON private key: {}", e)))?,
    );
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SwapError::Credential("TON private key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&secret))
}

/// One internal message carried by a wallet transfer
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub destination: TonAddress,
    pub value: U256,
    pub bounce: bool,
    pub body: Option<Arc<Cell>>,
    pub mode: u8,
}

impl OutgoingMessage {
    /// `int_msg_info` with zeroed fees and the body in a reference
    pub fn to_cell(&self) -> SwapResult<Cell> {
        let mut b = CellBuilder::new();
        b.store_bit(false)? // int_msg_info$0
            .store_bit(true)? // ihr_disabled
            .store_bit(self.bounce)?
            .store_bit(false)? // bounced
            .store_address(None)? // src, filled in by the wallet
            .store_address(Some(&self.destination))?
            .store_coins(self.value)?
            .store_bit(false)? // no extra currencies
            .store_coins(U256::zero())? // ihr_fee
            .store_coins(U256::zero())? // fwd_fee
            .store_uint(0, 64)? // created_lt
            .store_uint(0, 32)? // created_at
            .store_bit(false)?; // no state init
        match &self.body {
            Some(body) => {
                b.store_bit(true)?.store_ref(body.clone())?;
            }
            None => {
                b.store_bit(false)?;
            }
        }
        Ok(b.build())
    }
}

pub struct TonWallet {
    key: SigningKey,
    address: TonAddress,
    subwallet_id: u32,
}

impl TonWallet {
    pub fn new(key: SigningKey, address: TonAddress) -> Self {
        Self {
            key,
            address,
            subwallet_id: DEFAULT_SUBWALLET_ID,
        }
    }

    pub fn address(&self) -> &TonAddress {
        &self.address
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Signed external message for the given seqno
    pub fn transfer(
        &self,
        seqno: u32,
        valid_until: u32,
        messages: &[OutgoingMessage],
    ) -> SwapResult<Cell> {
        if messages.is_empty() || messages.len() > 4 {
            return Err(SwapError::Internal(format!(
                "wallet v4 carries 1..=4 messages, got {}",
                messages.len()
            )));
        }

        let mut body = CellBuilder::new();
        body.store_uint(u64::from(self.subwallet_id), 32)?
            .store_uint(u64::from(valid_until), 32)?
            .store_uint(u64::from(seqno), 32)?
            .store_uint(0, 8)?; // simple send
        for message in messages {
            body.store_uint(u64::from(message.mode), 8)?
                .store_ref(Arc::new(message.to_cell()?))?;
        }
        let body = body.build();

        let signature = self.key.sign(&body.hash());
        let mut signed = CellBuilder::new();
        signed
            .store_bytes(&signature.to_bytes())?
            .store_cell(&body)?;

        let mut external = CellBuilder::new();
        external
            .store_uint(0b10, 2)? // ext_in_msg_info$10
            .store_address(None)?
            .store_address(Some(&self.address))?
            .store_coins(U256::zero())? // import_fee
            .store_bit(false)? // no state init
            .store_bit(true)?
            .store_ref(signed.build_ref())?;
        Ok(external.build())
    }
}
