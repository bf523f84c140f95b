//! EIP-712 hashing of UserOperations, bit-compatible with `EntryPoint.getUserOpHash`.

use crate::error::{Error, Result};
use crate::types::UserOperation;
use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DOMAIN_NAME: &str = "ERC4337";
pub const DOMAIN_VERSION: &str = "1";

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

const PACKED_TYPE: &str = "PackedUserOperation(address sender,uint256 nonce,bytes initCode,bytes callData,bytes32 accountGasLimits,uint256 preVerificationGas,bytes32 gasFees,bytes paymasterAndData)";

const UNPACKED_LEGACY_TYPE: &str = "PackedUserOperation(address sender,uint256 nonce,bytes32 initCode,bytes32 callData,bytes32 accountGasLimits,uint256 preVerificationGas,bytes32 gasFees,bytes32 paymasterAndData)";

/// Which struct declaration the EntryPoint hashes against.
///
/// Both produce the same field words; only the type hash differs. No `Default`: a wrong
/// pick yields a hash the EntryPoint never reproduces, with no local error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashVariant {
    /// Dynamic fields declared `bytes32`, caller hashes them first.
    UnpackedLegacy,
    /// Dynamic fields declared `bytes`, hashed by the EIP-712 encoder.
    Packed,
}

impl HashVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            HashVariant::UnpackedLegacy => "unpacked-legacy",
            HashVariant::Packed => "packed",
        }
    }

    pub fn type_string(self) -> &'static str {
        match self {
            HashVariant::UnpackedLegacy => UNPACKED_LEGACY_TYPE,
            HashVariant::Packed => PACKED_TYPE,
        }
    }

    pub fn type_hash(self) -> H256 {
        H256(keccak256(self.type_string()))
    }

    fn dynamic_shape(self) -> &'static str {
        match self {
            HashVariant::UnpackedLegacy => "bytes32",
            HashVariant::Packed => "bytes",
        }
    }
}

impl fmt::Display for HashVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unpacked-legacy" => Ok(HashVariant::UnpackedLegacy),
            "packed" => Ok(HashVariant::Packed),
            other => Err(Error::Config(format!(
                "unknown hash variant {other:?} (expected \"packed\" or \"unpacked-legacy\")"
            ))),
        }
    }
}

/// `{name: "ERC4337", version: "1", chainId, verifyingContract: entryPoint}`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eip712Domain {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl Eip712Domain {
    pub fn new(chain_id: u64, entry_point: Address) -> Self {
        Self {
            chain_id,
            verifying_contract: entry_point,
        }
    }

    pub fn domain_separator(&self) -> H256 {
        let encoded = abi::encode(&[
            Token::FixedBytes(keccak256(DOMAIN_TYPE).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_NAME).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_VERSION).to_vec()),
            Token::Uint(U256::from(self.chain_id)),
            Token::Address(self.verifying_contract),
        ]);
        H256(keccak256(encoded))
    }
}

/// A `bytes` field as it enters the struct hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DynamicField {
    Raw(Bytes),
    Hashed(H256),
}

impl DynamicField {
    fn shape(&self) -> &'static str {
        match self {
            DynamicField::Raw(_) => "bytes",
            DynamicField::Hashed(_) => "bytes32",
        }
    }

    fn word(&self) -> H256 {
        match self {
            DynamicField::Raw(bytes) => H256(keccak256(bytes)),
            DynamicField::Hashed(hash) => *hash,
        }
    }
}

/// The eight fields covered by the signature, shaped for one [`HashVariant`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningView {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: DynamicField,
    pub call_data: DynamicField,
    pub account_gas_limits: H256,
    pub pre_verification_gas: U256,
    pub gas_fees: H256,
    pub paymaster_and_data: DynamicField,
}

impl UserOperation {
    pub fn signing_view(&self, variant: HashVariant) -> SigningView {
        let shape = |bytes: Bytes| match variant {
            HashVariant::UnpackedLegacy => DynamicField::Hashed(H256(keccak256(&bytes))),
            HashVariant::Packed => DynamicField::Raw(bytes),
        };
        SigningView {
            sender: self.sender,
            nonce: self.nonce,
            init_code: shape(self.init_code()),
            call_data: shape(self.call_data.clone()),
            account_gas_limits: self.account_gas_limits(),
            pre_verification_gas: self.pre_verification_gas,
            gas_fees: self.gas_fees(),
            paymaster_and_data: shape(self.paymaster_and_data()),
        }
    }
}

pub fn struct_hash(view: &SigningView, variant: HashVariant) -> Result<H256> {
    let expected = variant.dynamic_shape();
    for (field, value) in [
        ("initCode", &view.init_code),
        ("callData", &view.call_data),
        ("paymasterAndData", &view.paymaster_and_data),
    ] {
        if value.shape() != expected {
            return Err(Error::VariantMismatch {
                field,
                expected: variant.as_str(),
                found: value.shape(),
            });
        }
    }

    let encoded = abi::encode(&[
        Token::FixedBytes(variant.type_hash().as_bytes().to_vec()),
        Token::Address(view.sender),
        Token::Uint(view.nonce),
        Token::FixedBytes(view.init_code.word().as_bytes().to_vec()),
        Token::FixedBytes(view.call_data.word().as_bytes().to_vec()),
        Token::FixedBytes(view.account_gas_limits.as_bytes().to_vec()),
        Token::Uint(view.pre_verification_gas),
        Token::FixedBytes(view.gas_fees.as_bytes().to_vec()),
        Token::FixedBytes(view.paymaster_and_data.word().as_bytes().to_vec()),
    ]);
    Ok(H256(keccak256(encoded)))
}

/// `keccak256(0x1901 ‖ domainSeparator ‖ structHash)`
pub fn final_hash(domain_separator: H256, struct_hash: H256) -> H256 {
    let mut buf = Vec::with_capacity(66);
    buf.extend_from_slice(&[0x19, 0x01]);
    buf.extend_from_slice(domain_separator.as_bytes());
    buf.extend_from_slice(struct_hash.as_bytes());
    H256(keccak256(buf))
}

pub fn user_op_hash(op: &UserOperation, domain: &Eip712Domain, variant: HashVariant) -> Result<H256> {
    let view = op.signing_view(variant);
    let hash = final_hash(domain.domain_separator(), struct_hash(&view, variant)?);
    tracing::debug!(
        sender = ?op.sender,
        nonce = %op.nonce,
        chain_id = domain.chain_id,
        entry_point = ?domain.verifying_contract,
        variant = %variant,
        user_op_hash = ?hash,
        "computed userOpHash"
    );
    Ok(hash)
}
