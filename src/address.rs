//! Counterfactual (CREATE2) account addresses.

use crate::error::{Error, Result};
use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::{id, keccak256};

/// `keccak256(0xff ‖ factory ‖ salt ‖ initCodeHash)[12..]`
pub fn predict(factory: Address, salt: U256, init_code_hash: H256) -> Address {
    let mut salt_bytes = [0u8; 32];
    salt.to_big_endian(&mut salt_bytes);

    let mut buf = Vec::with_capacity(85);
    buf.push(0xff);
    buf.extend_from_slice(factory.as_bytes());
    buf.extend_from_slice(&salt_bytes);
    buf.extend_from_slice(init_code_hash.as_bytes());
    Address::from_slice(&keccak256(buf)[12..])
}

/// Agreement between the local prediction and the factory's `getAddress`.
pub fn cross_check(predicted: Address, reported: Address) -> Result<Address> {
    if predicted != reported {
        return Err(Error::AddressMismatch {
            predicted,
            reported,
        });
    }
    Ok(predicted)
}

/// Init code hash of the ERC1967 proxy a SimpleAccount-style factory deploys:
/// `creationCode ‖ abi.encode(implementation, abi.encodeCall(initialize, (owner)))`.
pub fn erc1967_init_code_hash(
    proxy_creation_code: &[u8],
    implementation: Address,
    owner: Address,
) -> H256 {
    let mut initialize = id("initialize(address)").to_vec();
    initialize.extend(abi::encode(&[Token::Address(owner)]));

    let mut init_code = proxy_creation_code.to_vec();
    init_code.extend(abi::encode(&[
        Token::Address(implementation),
        Token::Bytes(initialize),
    ]));
    H256(keccak256(init_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::utils::get_create2_address_from_hash;

    #[test]
    fn eip1014_vectors() {
        let predicted = predict(Address::zero(), U256::zero(), H256(keccak256([0x00u8])));
        assert_eq!(
            predicted,
            "0x4D1A2e2bB4F88F0250f26Ffff098B0b30B26BF38".parse::<Address>().unwrap()
        );

        let factory: Address = "0x00000000000000000000000000000000deadbeef".parse().unwrap();
        let predicted = predict(
            factory,
            U256::from(0xcafe_babeu64),
            H256(keccak256([0xdeu8, 0xad, 0xbe, 0xef])),
        );
        assert_eq!(
            predicted,
            "0x60f3f640a8508fC6a86d45DF051962668E1e8AC7".parse::<Address>().unwrap()
        );
    }

    #[test]
    fn matches_ethers_create2_helper() {
        for seed in 0u8..16 {
            let factory = Address::repeat_byte(seed.wrapping_mul(7).wrapping_add(1));
            let salt = U256::from(seed) << (seed as usize * 8);
            let init_code_hash = H256(keccak256([seed; 40]));

            let mut salt_bytes = [0u8; 32];
            salt.to_big_endian(&mut salt_bytes);
            assert_eq!(
                predict(factory, salt, init_code_hash),
                get_create2_address_from_hash(factory, salt_bytes, init_code_hash)
            );
        }
    }

    #[test]
    fn prediction_is_deterministic_and_salt_sensitive() {
        let factory: Address = "0xc6e7DF5E7b4f2A278906862b61205850344D4e7d".parse().unwrap();
        let hash = H256::repeat_byte(0x11);
        assert_eq!(
            predict(factory, U256::zero(), hash),
            predict(factory, U256::zero(), hash)
        );
        assert_ne!(
            predict(factory, U256::zero(), hash),
            predict(factory, U256::one(), hash)
        );
    }

    #[test]
    fn cross_check_reports_both_addresses() {
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        assert_eq!(cross_check(a, a).unwrap(), a);

        let err = cross_check(a, b).unwrap_err();
        assert!(matches!(
            err,
            Error::AddressMismatch { predicted, reported } if predicted == a && reported == b
        ));
        let msg = err.to_string();
        assert!(msg.contains(&format!("{a:?}")) && msg.contains(&format!("{b:?}")));
    }

    #[test]
    fn proxy_init_code_layout() {
        let creation_code = [0x60u8, 0x80, 0x60, 0x40];
        let implementation = Address::repeat_byte(0x12);
        let owner: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();

        let mut expected = creation_code.to_vec();
        expected.extend(hex::decode(
            "0000000000000000000000001212121212121212121212121212121212121212\
             0000000000000000000000000000000000000000000000000000000000000040\
             0000000000000000000000000000000000000000000000000000000000000024\
             c4d66de8000000000000000000000000f39fd6e51aad88f6f4ce6ab8827279cf\
             ffb9226600000000000000000000000000000000000000000000000000000000",
        )
        .unwrap());

        assert_eq!(
            erc1967_init_code_hash(&creation_code, implementation, owner),
            H256(keccak256(expected))
        );
        assert_ne!(
            erc1967_init_code_hash(&creation_code, implementation, Address::zero()),
            erc1967_init_code_hash(&creation_code, implementation, owner)
        );
    }
}
