//! Packing of two 128-bit quantities into one 32-byte word, the layout the EntryPoint uses
//! for `accountGasLimits`, `gasFees` and the paymaster gas limits.

use crate::error::{Error, Result};
use ethers::types::{H256, U256};

/// Checks that `value` fits in 128 bits and narrows it.
pub fn to_u128(field: &'static str, value: U256) -> Result<u128> {
    if value.bits() > 128 {
        return Err(Error::ValueOutOfRange { field, value });
    }
    Ok(value.as_u128())
}

/// `high ‖ low`, each left-padded to 16 bytes.
pub fn pack_uint(high: U256, low: U256) -> Result<H256> {
    let high = to_u128("high", high)?;
    let low = to_u128("low", low)?;
    Ok(pack_u128(high, low))
}

pub fn pack_u128(high: u128, low: u128) -> H256 {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&high.to_be_bytes());
    word[16..].copy_from_slice(&low.to_be_bytes());
    H256(word)
}

pub fn unpack_uint(word: H256) -> (u128, u128) {
    let mut high = [0u8; 16];
    let mut low = [0u8; 16];
    high.copy_from_slice(&word.as_bytes()[..16]);
    low.copy_from_slice(&word.as_bytes()[16..]);
    (u128::from_be_bytes(high), u128::from_be_bytes(low))
}
