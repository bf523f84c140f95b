//! Assembly of a UserOperation from on-chain state and caller intent.

use crate::address;
use crate::config::NetworkConfig;
use crate::contracts::{self, AccountFactoryReader, EntryPointReader};
use crate::eip712::{Eip712Domain, HashVariant};
use crate::error::{Error, Result};
use crate::gas;
use crate::paymaster::{self, PaymasterAndData};
use crate::signer::{self, UserOpSigner};
use crate::types::{FactoryCall, SignedUserOperation, UserOperation};
use ethers::types::{Address, Bytes, H256, U256};

pub const DEFAULT_VERIFICATION_GAS_LIMIT: u64 = 500_000;
pub const DEFAULT_CALL_GAS_LIMIT: u64 = 300_000;
pub const DEFAULT_PRE_VERIFICATION_GAS: u64 = 100_000;
pub const DEFAULT_MAX_PRIORITY_FEE_PER_GAS: u64 = 1_000_000_000;
pub const DEFAULT_MAX_FEE_PER_GAS: u64 = 3_000_000_000;
pub const DEFAULT_PAYMASTER_VERIFICATION_GAS_LIMIT: u64 = 100_000;
pub const DEFAULT_PAYMASTER_POST_OP_GAS_LIMIT: u64 = 50_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderSpec {
    Existing(Address),
    /// Derived from the factory. With `init_code_hash` set the address is also predicted
    /// locally and must agree with the factory.
    Counterfactual {
        owner: Address,
        salt: U256,
        init_code_hash: Option<H256>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSender {
    pub address: Address,
    /// Present only while the account has no code.
    pub factory: Option<FactoryCall>,
}

impl ResolvedSender {
    pub fn deployed(&self) -> bool {
        self.factory.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallSpec {
    /// Empty callData; the op only deploys the account.
    None,
    Execute {
        target: Address,
        value: U256,
        data: Bytes,
    },
    ExecuteBatch {
        calls: Vec<(Address, Bytes)>,
    },
    Raw(Bytes),
}

pub fn encode_call_data(call: &CallSpec) -> Result<Bytes> {
    match call {
        CallSpec::None => Ok(Bytes::default()),
        CallSpec::Execute {
            target,
            value,
            data,
        } => contracts::execute_call_data(*target, *value, data),
        CallSpec::ExecuteBatch { calls } => contracts::execute_batch_call_data(calls),
        CallSpec::Raw(data) => Ok(data.clone()),
    }
}

/// Caller-supplied gas values; anything left `None` takes the static default. No
/// estimation happens here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GasSettings {
    pub verification_gas_limit: Option<U256>,
    pub call_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
}

fn or_default(value: Option<U256>, default: u64) -> U256 {
    value.unwrap_or_else(|| U256::from(default))
}

pub struct UserOperationBuilder<'a, E: ?Sized, F: ?Sized> {
    network: &'a NetworkConfig,
    entry_point: &'a E,
    factory: &'a F,
    nonce_key: U256,
}

impl<'a, E, F> UserOperationBuilder<'a, E, F>
where
    E: EntryPointReader + ?Sized,
    F: AccountFactoryReader + ?Sized,
{
    pub fn new(network: &'a NetworkConfig, entry_point: &'a E, factory: &'a F) -> Self {
        Self {
            network,
            entry_point,
            factory,
            nonce_key: U256::zero(),
        }
    }

    /// 192-bit key of the EntryPoint's two-dimensional nonce.
    pub fn with_nonce_key(mut self, key: U256) -> Self {
        self.nonce_key = key;
        self
    }

    pub fn domain(&self) -> Eip712Domain {
        Eip712Domain::new(self.network.chain_id, self.network.entry_point)
    }

    pub async fn resolve_sender(&self, spec: &SenderSpec) -> Result<ResolvedSender> {
        match spec {
            SenderSpec::Existing(sender) => {
                if !self.factory.is_deployed(*sender).await? {
                    tracing::warn!(sender = ?sender, "sender has no code and no factory data; validation will fail with AA20");
                }
                Ok(ResolvedSender {
                    address: *sender,
                    factory: None,
                })
            }
            SenderSpec::Counterfactual {
                owner,
                salt,
                init_code_hash,
            } => {
                let reported = self.factory.get_address(*owner, *salt).await?;
                if let Some(hash) = init_code_hash {
                    let predicted = address::predict(self.factory.address(), *salt, *hash);
                    address::cross_check(predicted, reported)?;
                }

                let deployed = self.factory.is_deployed(reported).await?;
                tracing::info!(sender = ?reported, owner = ?owner, salt = %salt, deployed, "resolved sender");

                let factory = if deployed {
                    None
                } else {
                    Some(FactoryCall {
                        factory: self.factory.address(),
                        factory_data: contracts::create_account_call_data(*owner, *salt)?,
                    })
                };
                Ok(ResolvedSender {
                    address: reported,
                    factory,
                })
            }
        }
    }

    /// Read fresh from the EntryPoint on every call.
    pub async fn resolve_nonce(&self, sender: Address) -> Result<U256> {
        self.entry_point.get_nonce(sender, self.nonce_key).await
    }

    pub async fn build(
        &self,
        sender: &SenderSpec,
        call: &CallSpec,
        settings: &GasSettings,
        sponsor: bool,
    ) -> Result<UserOperation> {
        let resolved = self.resolve_sender(sender).await?;
        let nonce = self.resolve_nonce(resolved.address).await?;
        let call_data = encode_call_data(call)?;

        let paymaster = if sponsor {
            let pm = self.network.paymaster.ok_or_else(|| {
                Error::Config("sponsorship requested but no paymaster is configured".to_string())
            })?;
            paymaster::check_sponsorship(
                self.factory,
                self.entry_point,
                pm,
                resolved.address,
                !resolved.deployed(),
            )
            .await?;
            Some(PaymasterAndData {
                paymaster: pm,
                verification_gas_limit: gas::to_u128(
                    "paymasterVerificationGasLimit",
                    or_default(
                        settings.paymaster_verification_gas_limit,
                        DEFAULT_PAYMASTER_VERIFICATION_GAS_LIMIT,
                    ),
                )?,
                post_op_gas_limit: gas::to_u128(
                    "paymasterPostOpGasLimit",
                    or_default(
                        settings.paymaster_post_op_gas_limit,
                        DEFAULT_PAYMASTER_POST_OP_GAS_LIMIT,
                    ),
                )?,
                paymaster_data: Bytes::default(),
            })
        } else {
            None
        };

        let op = UserOperation {
            sender: resolved.address,
            nonce,
            factory: resolved.factory,
            call_data,
            verification_gas_limit: gas::to_u128(
                "verificationGasLimit",
                or_default(settings.verification_gas_limit, DEFAULT_VERIFICATION_GAS_LIMIT),
            )?,
            call_gas_limit: gas::to_u128(
                "callGasLimit",
                or_default(settings.call_gas_limit, DEFAULT_CALL_GAS_LIMIT),
            )?,
            pre_verification_gas: or_default(settings.pre_verification_gas, DEFAULT_PRE_VERIFICATION_GAS),
            max_priority_fee_per_gas: gas::to_u128(
                "maxPriorityFeePerGas",
                or_default(settings.max_priority_fee_per_gas, DEFAULT_MAX_PRIORITY_FEE_PER_GAS),
            )?,
            max_fee_per_gas: gas::to_u128(
                "maxFeePerGas",
                or_default(settings.max_fee_per_gas, DEFAULT_MAX_FEE_PER_GAS),
            )?,
            paymaster,
        };
        tracing::debug!(sender = ?op.sender, nonce = %op.nonce, sponsored = sponsor, "built user operation");
        Ok(op)
    }

    pub async fn sign<S>(
        &self,
        op: UserOperation,
        variant: HashVariant,
        signer: &S,
    ) -> Result<SignedUserOperation>
    where
        S: UserOpSigner + ?Sized,
    {
        signer::sign_user_operation(op, &self.domain(), variant, signer).await
    }
}

/// Cross-checks the locally computed hash against `EntryPoint.getUserOpHash`.
pub async fn verify_hash<E>(oracle: &E, signed: &SignedUserOperation) -> Result<H256>
where
    E: EntryPointReader + ?Sized,
{
    let expected = oracle.get_user_op_hash(&signed.to_packed()).await?;
    let computed = signed.user_op_hash();
    if expected != computed {
        return Err(Error::HashMismatch { expected, computed });
    }
    Ok(computed)
}

/// Signature recovery against both the operation as signed and the operation the bundler
/// echoed back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoCheck {
    pub signed_hash: H256,
    pub signed_recovers_to: Address,
    pub echoed_hash: H256,
    pub echoed_recovers_to: Address,
}

impl EchoCheck {
    /// The bundler passed the operation through unchanged, so the signature still covers it.
    pub fn unchanged(&self) -> bool {
        self.signed_hash == self.echoed_hash
    }
}

pub fn verify_echoed(
    signed: &SignedUserOperation,
    echoed: &UserOperation,
    domain: &Eip712Domain,
    variant: HashVariant,
) -> Result<EchoCheck> {
    let signed_hash = signed.user_op_hash();
    let echoed_hash = echoed.hash(domain, variant)?;
    let check = EchoCheck {
        signed_hash,
        signed_recovers_to: signer::recover(signed_hash, signed.signature())?,
        echoed_hash,
        echoed_recovers_to: signer::recover(echoed_hash, signed.signature())?,
    };
    if !check.unchanged() {
        tracing::warn!(
            signed = ?check.signed_hash,
            echoed = ?check.echoed_hash,
            "bundler echoed a different operation than the one signed"
        );
    }
    Ok(check)
}
