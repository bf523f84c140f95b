use crate::contracts::{AccountFactoryReader, EntryPointReader};
use crate::error::{Error, Result};
use crate::gas;
use ethers::types::{Address, Bytes, U256};

/// `paymaster (20) ‖ packUint(verificationGasLimit, postOpGasLimit) (32)`
pub const PAYMASTER_DATA_OFFSET: usize = 52;

/// Decoded `paymasterAndData` (EntryPoint v0.7+ layout).
///
/// The two gas limits share ONE 32-byte big-endian word, high half first. This is the
/// layout bundlers and the EntryPoint read back with `UserOperationLib.unpackPaymasterStaticFields`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymasterAndData {
    pub paymaster: Address,
    pub verification_gas_limit: u128,
    pub post_op_gas_limit: u128,
    pub paymaster_data: Bytes,
}

impl PaymasterAndData {
    pub fn to_bytes(&self) -> Bytes {
        let mut v = Vec::with_capacity(PAYMASTER_DATA_OFFSET + self.paymaster_data.len());
        v.extend_from_slice(self.paymaster.as_bytes());
        v.extend_from_slice(
            gas::pack_u128(self.verification_gas_limit, self.post_op_gas_limit).as_bytes(),
        );
        v.extend_from_slice(self.paymaster_data.as_ref());
        Bytes::from(v)
    }
}

pub fn encode(
    paymaster: Address,
    verification_gas_limit: U256,
    post_op_gas_limit: U256,
    paymaster_data: &[u8],
) -> Result<Bytes> {
    let fields = PaymasterAndData {
        paymaster,
        verification_gas_limit: gas::to_u128("paymasterVerificationGasLimit", verification_gas_limit)?,
        post_op_gas_limit: gas::to_u128("paymasterPostOpGasLimit", post_op_gas_limit)?,
        paymaster_data: Bytes::from(paymaster_data.to_vec()),
    };
    Ok(fields.to_bytes())
}

pub fn decode(bytes: &[u8]) -> Result<PaymasterAndData> {
    if bytes.len() < PAYMASTER_DATA_OFFSET {
        return Err(Error::MalformedPaymasterData {
            expected_min: PAYMASTER_DATA_OFFSET,
            actual: bytes.len(),
        });
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&bytes[20..PAYMASTER_DATA_OFFSET]);
    let (verification_gas_limit, post_op_gas_limit) = gas::unpack_uint(word.into());

    Ok(PaymasterAndData {
        paymaster: Address::from_slice(&bytes[..20]),
        verification_gas_limit,
        post_op_gas_limit,
        paymaster_data: Bytes::from(bytes[PAYMASTER_DATA_OFFSET..].to_vec()),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SponsorshipStatus {
    pub registered: bool,
    pub deposit: U256,
}

/// Preflight for the registration-gated paymaster.
///
/// The paymaster only sponsors senders the factory has registered. A sender deployed by this
/// very operation is registered during deployment, so it passes even though the factory does
/// not know it yet.
pub async fn check_sponsorship<F, E>(
    factory: &F,
    entry_point: &E,
    paymaster: Address,
    sender: Address,
    deployed_by_this_op: bool,
) -> Result<SponsorshipStatus>
where
    F: AccountFactoryReader + ?Sized,
    E: EntryPointReader + ?Sized,
{
    let deposit = entry_point.balance_of(paymaster).await?;
    if deposit.is_zero() {
        tracing::warn!(paymaster = ?paymaster, "paymaster has no EntryPoint deposit; validation will fail with AA31");
    }

    let registered = deployed_by_this_op || factory.is_registered(sender).await?;
    if !registered {
        return Err(Error::SenderNotRegistered { sender });
    }

    tracing::debug!(sender = ?sender, paymaster = ?paymaster, deposit = %deposit, "sponsorship preflight passed");
    Ok(SponsorshipStatus {
        registered,
        deposit,
    })
}
