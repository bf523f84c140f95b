use crate::eip712::{self, Eip712Domain, HashVariant};
use crate::error::{Error, Result, Stage};
use crate::gas;
use crate::paymaster::{self, PaymasterAndData};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment instructions for a sender that does not exist yet.
///
/// Serialized on the v0.6 wire as `initCode = factory ‖ factoryData`, and on the v0.7 wire as
/// two separate fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryCall {
    pub factory: Address,
    pub factory_data: Bytes,
}

impl FactoryCall {
    pub fn init_code(&self) -> Bytes {
        let mut v = Vec::with_capacity(20 + self.factory_data.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(self.factory_data.as_ref());
        Bytes::from(v)
    }

    /// Splits a v0.6 `initCode`. Empty input means "already deployed".
    pub fn from_init_code(init_code: &[u8]) -> Result<Option<Self>> {
        match init_code.len() {
            0 => Ok(None),
            n if n < 20 => Err(Error::MalformedInitCode { actual: n }),
            _ => Ok(Some(Self {
                factory: Address::from_slice(&init_code[..20]),
                factory_data: Bytes::from(init_code[20..].to_vec()),
            })),
        }
    }
}

/// Bundler JSON-RPC shape of a UserOperation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `initCode`, `paymasterAndData`, numeric gas fields.
    V06,
    /// `factory`/`factoryData`, `paymaster*` fields, numeric gas fields.
    V07,
}

/// ERC-4337 UserOperation, canonical form.
///
/// Every 128-bit sub-field of the packed words is held as `u128`, so
/// `accountGasLimits`, `gasFees` and the paymaster gas word can always be packed.
/// The struct never caches its hash: every call to [`UserOperation::hash`] recomputes it from
/// the current fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<FactoryCall>,
    pub call_data: Bytes,
    pub verification_gas_limit: u128,
    pub call_gas_limit: u128,
    pub pre_verification_gas: U256,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub paymaster: Option<PaymasterAndData>,
}

impl UserOperation {
    pub fn init_code(&self) -> Bytes {
        self.factory
            .as_ref()
            .map(FactoryCall::init_code)
            .unwrap_or_default()
    }

    /// `packUint(verificationGasLimit, callGasLimit)`
    pub fn account_gas_limits(&self) -> H256 {
        gas::pack_u128(self.verification_gas_limit, self.call_gas_limit)
    }

    /// `packUint(maxPriorityFeePerGas, maxFeePerGas)`
    pub fn gas_fees(&self) -> H256 {
        gas::pack_u128(self.max_priority_fee_per_gas, self.max_fee_per_gas)
    }

    pub fn paymaster_and_data(&self) -> Bytes {
        self.paymaster
            .as_ref()
            .map(PaymasterAndData::to_bytes)
            .unwrap_or_default()
    }

    pub fn hash(&self, domain: &Eip712Domain, variant: HashVariant) -> Result<H256> {
        eip712::user_op_hash(self, domain, variant)
    }

    pub fn to_packed(&self, signature: Bytes) -> PackedUserOperation {
        PackedUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            init_code: self.init_code(),
            call_data: self.call_data.clone(),
            account_gas_limits: self.account_gas_limits(),
            pre_verification_gas: self.pre_verification_gas,
            gas_fees: self.gas_fees(),
            paymaster_and_data: self.paymaster_and_data(),
            signature,
        }
    }

    /// Parses the on-chain form back into the canonical model, returning the signature
    /// alongside.
    pub fn from_packed(packed: &PackedUserOperation) -> Result<(Self, Bytes)> {
        let (verification_gas_limit, call_gas_limit) = gas::unpack_uint(packed.account_gas_limits);
        let (max_priority_fee_per_gas, max_fee_per_gas) = gas::unpack_uint(packed.gas_fees);
        let paymaster = if packed.paymaster_and_data.is_empty() {
            None
        } else {
            Some(paymaster::decode(&packed.paymaster_and_data)?)
        };

        let op = Self {
            sender: packed.sender,
            nonce: packed.nonce,
            factory: FactoryCall::from_init_code(&packed.init_code)?,
            call_data: packed.call_data.clone(),
            verification_gas_limit,
            call_gas_limit,
            pre_verification_gas: packed.pre_verification_gas,
            max_priority_fee_per_gas,
            max_fee_per_gas,
            paymaster,
        };
        Ok((op, packed.signature.clone()))
    }
}

/// The Solidity `PackedUserOperation` tuple accepted by `getUserOpHash`, `validateUserOp`
/// and `handleOps` (EntryPoint v0.7+).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub account_gas_limits: H256,
    pub pre_verification_gas: U256,
    pub gas_fees: H256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl PackedUserOperation {
    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))`.
    #[allow(clippy::type_complexity)]
    pub fn as_abi_tuple(&self) -> (Address, U256, Bytes, Bytes, H256, U256, H256, Bytes, Bytes) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.account_gas_limits,
            self.pre_verification_gas,
            self.gas_fees,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }
}

/// Lifecycle of a single submission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Draft,
    Signed,
    Submitted,
    Confirmed,
    Rejected,
    TimedOut,
}

impl OpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Draft => "draft",
            OpStatus::Signed => "signed",
            OpStatus::Submitted => "submitted",
            OpStatus::Confirmed => "confirmed",
            OpStatus::Rejected => "rejected",
            OpStatus::TimedOut => "timed-out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OpStatus::Confirmed | OpStatus::Rejected | OpStatus::TimedOut)
    }

    /// Moves to `next`, refusing to skip a state or leave a terminal one.
    pub fn advance(self, next: OpStatus) -> Result<OpStatus> {
        let allowed = matches!(
            (self, next),
            (OpStatus::Draft, OpStatus::Signed)
                | (OpStatus::Signed, OpStatus::Submitted)
                | (
                    OpStatus::Submitted,
                    OpStatus::Confirmed | OpStatus::Rejected | OpStatus::TimedOut
                )
        );
        if !allowed {
            let stage = match next {
                OpStatus::Draft | OpStatus::Signed => Stage::Sign,
                OpStatus::Submitted => Stage::Submit,
                _ => Stage::Poll,
            };
            return Err(Error::InvalidTransition {
                stage,
                from: self.as_str(),
                to: next.as_str(),
            });
        }
        Ok(next)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UserOperation frozen together with the hash it was signed over.
///
/// Only obtainable through [`crate::signer::sign_user_operation`]. The operation cannot be
/// mutated in place; [`SignedUserOperation::into_draft`] hands back an editable copy and
/// drops the now-stale signature.
#[derive(Clone, Debug)]
pub struct SignedUserOperation {
    op: UserOperation,
    signature: Bytes,
    user_op_hash: H256,
    domain: Eip712Domain,
    variant: HashVariant,
}

impl SignedUserOperation {
    pub(crate) fn new(
        op: UserOperation,
        signature: Bytes,
        user_op_hash: H256,
        domain: Eip712Domain,
        variant: HashVariant,
    ) -> Self {
        Self {
            op,
            signature,
            user_op_hash,
            domain,
            variant,
        }
    }

    pub fn op(&self) -> &UserOperation {
        &self.op
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn user_op_hash(&self) -> H256 {
        self.user_op_hash
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    pub fn variant(&self) -> HashVariant {
        self.variant
    }

    pub fn status(&self) -> OpStatus {
        OpStatus::Signed
    }

    pub fn to_packed(&self) -> PackedUserOperation {
        self.op.to_packed(self.signature.clone())
    }

    pub fn to_wire(&self, format: WireFormat) -> serde_json::Value {
        crate::encoding::user_op_to_json(&self.op, &self.signature, format)
    }

    pub fn into_draft(self) -> UserOperation {
        self.op
    }
}
