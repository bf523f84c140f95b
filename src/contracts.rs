//! Read-only views of the on-chain collaborators (EntryPoint, AccountFactory, SmartAccount).
//!
//! The traits are the seams the builder depends on; the `*Contract` types implement them
//! over any ethers [`Middleware`].

use crate::error::{Error, Result, Stage};
use crate::types::PackedUserOperation;
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, Token};
use ethers::prelude::*;
use std::fmt::Display;
use std::sync::Arc;

const GET_USER_OP_HASH_ABI: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"bytes32","name":"accountGasLimits","type":"bytes32"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"bytes32","name":"gasFees","type":"bytes32"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct PackedUserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#;

const VALIDATE_USER_OP_ABI: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"bytes32","name":"accountGasLimits","type":"bytes32"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"bytes32","name":"gasFees","type":"bytes32"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct PackedUserOperation","name":"userOp","type":"tuple"},{"internalType":"bytes32","name":"userOpHash","type":"bytes32"},{"internalType":"uint256","name":"missingAccountFunds","type":"uint256"}],"name":"validateUserOp","outputs":[{"internalType":"uint256","name":"validationData","type":"uint256"}],"stateMutability":"nonpayable","type":"function"}]"#;

#[async_trait]
pub trait EntryPointReader: Send + Sync {
    fn address(&self) -> Address;

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256>;

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256>;

    /// Deposit held by `account` (sender or paymaster) on the EntryPoint.
    async fn balance_of(&self, account: Address) -> Result<U256>;
}

#[async_trait]
pub trait AccountFactoryReader: Send + Sync {
    fn address(&self) -> Address;

    async fn get_address(&self, owner: Address, salt: U256) -> Result<Address>;

    async fn is_registered(&self, account: Address) -> Result<bool>;

    async fn is_deployed(&self, account: Address) -> Result<bool>;
}

#[async_trait]
pub trait SmartAccountReader: Send + Sync {
    async fn owner(&self) -> Result<Address>;

    async fn entry_point(&self) -> Result<Address>;

    async fn get_nonce(&self) -> Result<U256>;

    /// `validateUserOp(op, hash, 0)` as an `eth_call` from the EntryPoint, the account's
    /// only permitted caller. Nothing is sent.
    async fn simulate_validation(
        &self,
        op: &PackedUserOperation,
        user_op_hash: H256,
        entry_point: Address,
    ) -> Result<ValidationData>;
}

/// Result of `validateUserOp`, unpacked per ERC-4337:
/// `aggregator (20) | validUntil (6) | validAfter (6)`, low bytes first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationData {
    pub aggregator: Address,
    pub valid_until: u64,
    pub valid_after: u64,
}

impl ValidationData {
    pub fn from_word(word: U256) -> Self {
        let mut bytes = [0u8; 32];
        word.to_big_endian(&mut bytes);
        let valid_after = u64_from_be(&bytes[0..6]);
        let valid_until = u64_from_be(&bytes[6..12]);
        Self {
            aggregator: Address::from_slice(&bytes[12..32]),
            valid_until,
            valid_after,
        }
    }

    /// `aggregator == address(1)` is the SIG_VALIDATION_FAILED marker.
    pub fn signature_failed(&self) -> bool {
        self.aggregator == Address::from_low_u64_be(1)
    }

    pub fn is_success(&self) -> bool {
        self.aggregator.is_zero()
    }
}

fn u64_from_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn collaborator<E: Display>(stage: Stage, call: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Collaborator {
        stage,
        call,
        message: e.to_string(),
    }
}

fn encode_function(signature: &str, name: &str, args: &[Token]) -> Result<Bytes> {
    let abi = AbiParser::default()
        .parse(&[signature])
        .map_err(|e| Error::invalid_field("abi", e))?;
    let data = abi
        .function(name)
        .and_then(|f| f.encode_input(args))
        .map_err(|e| Error::invalid_field("callData", e))?;
    Ok(Bytes::from(data))
}

/// `SimpleAccount.execute(address dest, uint256 value, bytes func)`
pub fn execute_call_data(target: Address, value: U256, data: &Bytes) -> Result<Bytes> {
    encode_function(
        "function execute(address dest, uint256 value, bytes func)",
        "execute",
        &[
            Token::Address(target),
            Token::Uint(value),
            Token::Bytes(data.to_vec()),
        ],
    )
}

/// `SimpleAccount.executeBatch(address[] dest, bytes[] func)`
pub fn execute_batch_call_data(calls: &[(Address, Bytes)]) -> Result<Bytes> {
    let dests = calls.iter().map(|(a, _)| Token::Address(*a)).collect();
    let funcs = calls.iter().map(|(_, d)| Token::Bytes(d.to_vec())).collect();
    encode_function(
        "function executeBatch(address[] dest, bytes[] func)",
        "executeBatch",
        &[Token::Array(dests), Token::Array(funcs)],
    )
}

/// `AccountFactory.createAccount(address owner, uint256 salt)`, the `factoryData` of a
/// counterfactual deployment.
pub fn create_account_call_data(owner: Address, salt: U256) -> Result<Bytes> {
    encode_function(
        "function createAccount(address owner, uint256 salt) returns (address)",
        "createAccount",
        &[Token::Address(owner), Token::Uint(salt)],
    )
}

/// `EntryPoint.depositTo(address account)`; the caller sends it with the deposit as value.
pub fn deposit_to_call_data(account: Address) -> Result<Bytes> {
    encode_function(
        "function depositTo(address account) payable",
        "depositTo",
        &[Token::Address(account)],
    )
}

#[derive(Debug)]
pub struct EntryPointContract<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> EntryPointContract<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        let mut abi: Abi = serde_json::from_str(GET_USER_OP_HASH_ABI)
            .map_err(|e| Error::Config(format!("failed to parse EntryPoint ABI: {e}")))?;
        let views = AbiParser::default()
            .parse(&[
                "function getNonce(address sender, uint192 key) view returns (uint256)",
                "function balanceOf(address account) view returns (uint256)",
            ])
            .map_err(|e| Error::Config(format!("failed to parse EntryPoint ABI: {e}")))?;
        abi.functions.extend(views.functions);

        Ok(Self {
            contract: Contract::new(address, abi, client),
        })
    }
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointReader for EntryPointContract<M> {
    fn address(&self) -> Address {
        self.contract.address()
    }

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256> {
        let call = "EntryPoint.getNonce";
        self.contract
            .method::<_, U256>("getNonce", (sender, key))
            .map_err(collaborator(Stage::Encode, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Encode, call))
    }

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256> {
        let call = "EntryPoint.getUserOpHash";
        self.contract
            .method::<_, H256>("getUserOpHash", (op.as_abi_tuple(),))
            .map_err(collaborator(Stage::Hash, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Hash, call))
    }

    async fn balance_of(&self, account: Address) -> Result<U256> {
        let call = "EntryPoint.balanceOf";
        self.contract
            .method::<_, U256>("balanceOf", account)
            .map_err(collaborator(Stage::Config, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Config, call))
    }
}

#[derive(Debug)]
pub struct AccountFactoryContract<M> {
    contract: Contract<M>,
    client: Arc<M>,
}

impl<M: Middleware + 'static> AccountFactoryContract<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        let abi = AbiParser::default()
            .parse(&[
                "function getAddress(address owner, uint256 salt) view returns (address)",
                "function isRegistedAccount(address account) view returns (bool)",
            ])
            .map_err(|e| Error::Config(format!("failed to parse factory ABI: {e}")))?;
        Ok(Self {
            contract: Contract::new(address, abi, client.clone()),
            client,
        })
    }
}

#[async_trait]
impl<M: Middleware + 'static> AccountFactoryReader for AccountFactoryContract<M> {
    fn address(&self) -> Address {
        self.contract.address()
    }

    async fn get_address(&self, owner: Address, salt: U256) -> Result<Address> {
        let call = "AccountFactory.getAddress";
        self.contract
            .method::<_, Address>("getAddress", (owner, salt))
            .map_err(collaborator(Stage::Config, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Config, call))
    }

    async fn is_registered(&self, account: Address) -> Result<bool> {
        let call = "AccountFactory.isRegistedAccount";
        self.contract
            .method::<_, bool>("isRegistedAccount", account)
            .map_err(collaborator(Stage::Config, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Config, call))
    }

    async fn is_deployed(&self, account: Address) -> Result<bool> {
        let code = self
            .client
            .get_code(account, None)
            .await
            .map_err(collaborator(Stage::Config, "eth_getCode"))?;
        Ok(!code.as_ref().is_empty())
    }
}

#[derive(Debug)]
pub struct SmartAccountContract<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> SmartAccountContract<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        let mut abi: Abi = serde_json::from_str(VALIDATE_USER_OP_ABI)
            .map_err(|e| Error::Config(format!("failed to parse account ABI: {e}")))?;
        let views = AbiParser::default()
            .parse(&[
                "function owner() view returns (address)",
                "function entryPoint() view returns (address)",
                "function getNonce() view returns (uint256)",
            ])
            .map_err(|e| Error::Config(format!("failed to parse account ABI: {e}")))?;
        abi.functions.extend(views.functions);
        Ok(Self {
            contract: Contract::new(address, abi, client),
        })
    }
}

#[async_trait]
impl<M: Middleware + 'static> SmartAccountReader for SmartAccountContract<M> {
    async fn owner(&self) -> Result<Address> {
        let call = "SmartAccount.owner";
        self.contract
            .method::<_, Address>("owner", ())
            .map_err(collaborator(Stage::Config, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Config, call))
    }

    async fn entry_point(&self) -> Result<Address> {
        let call = "SmartAccount.entryPoint";
        self.contract
            .method::<_, Address>("entryPoint", ())
            .map_err(collaborator(Stage::Config, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Config, call))
    }

    async fn get_nonce(&self) -> Result<U256> {
        let call = "SmartAccount.getNonce";
        self.contract
            .method::<_, U256>("getNonce", ())
            .map_err(collaborator(Stage::Encode, call))?
            .call()
            .await
            .map_err(collaborator(Stage::Encode, call))
    }

    async fn simulate_validation(
        &self,
        op: &PackedUserOperation,
        user_op_hash: H256,
        entry_point: Address,
    ) -> Result<ValidationData> {
        let call = "SmartAccount.validateUserOp";
        let word = self
            .contract
            .method::<_, U256>(
                "validateUserOp",
                (op.as_abi_tuple(), user_op_hash, U256::zero()),
            )
            .map_err(collaborator(Stage::Sign, call))?
            .from(entry_point)
            .call()
            .await
            .map_err(collaborator(Stage::Sign, call))?;
        Ok(ValidationData::from_word(word))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::eip712::{Eip712Domain, HashVariant};
    use crate::types::UserOperation;
    use std::collections::{HashMap, HashSet};

    /// In-memory EntryPoint. `get_user_op_hash` answers with the packed-variant EIP-712 hash,
    /// which is what a v0.8 EntryPoint computes.
    #[derive(Debug, Default)]
    pub(crate) struct FakeEntryPoint {
        pub(crate) address: Address,
        pub(crate) chain_id: u64,
        pub(crate) nonces: HashMap<Address, U256>,
        pub(crate) balances: HashMap<Address, U256>,
    }

    impl FakeEntryPoint {
        pub(crate) fn new(address: Address, chain_id: u64) -> Self {
            Self {
                address,
                chain_id,
                ..Default::default()
            }
        }

        pub(crate) fn with_nonce(mut self, sender: Address, nonce: U256) -> Self {
            self.nonces.insert(sender, nonce);
            self
        }

        pub(crate) fn with_balance(mut self, account: Address, balance: U256) -> Self {
            self.balances.insert(account, balance);
            self
        }
    }

    #[async_trait]
    impl EntryPointReader for FakeEntryPoint {
        fn address(&self) -> Address {
            self.address
        }

        async fn get_nonce(&self, sender: Address, _key: U256) -> Result<U256> {
            Ok(self.nonces.get(&sender).copied().unwrap_or_default())
        }

        async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256> {
            let (op, _) = UserOperation::from_packed(op)?;
            op.hash(
                &Eip712Domain::new(self.chain_id, self.address),
                HashVariant::Packed,
            )
        }

        async fn balance_of(&self, account: Address) -> Result<U256> {
            Ok(self.balances.get(&account).copied().unwrap_or_default())
        }
    }

    /// In-memory factory with a fixed address book.
    #[derive(Debug, Default)]
    pub(crate) struct FakeFactory {
        pub(crate) address: Address,
        pub(crate) accounts: HashMap<(Address, U256), Address>,
        pub(crate) registered: HashSet<Address>,
        pub(crate) deployed: HashSet<Address>,
    }

    impl FakeFactory {
        pub(crate) fn with_account(mut self, owner: Address, salt: U256, account: Address) -> Self {
            self.accounts.insert((owner, salt), account);
            self
        }

        pub(crate) fn with_registered(mut self, account: Address) -> Self {
            self.registered.insert(account);
            self
        }

        pub(crate) fn with_deployed(mut self, account: Address) -> Self {
            self.deployed.insert(account);
            self
        }
    }

    #[async_trait]
    impl AccountFactoryReader for FakeFactory {
        fn address(&self) -> Address {
            self.address
        }

        async fn get_address(&self, owner: Address, salt: U256) -> Result<Address> {
            self.accounts
                .get(&(owner, salt))
                .copied()
                .ok_or_else(|| Error::Collaborator {
                    stage: Stage::Config,
                    call: "AccountFactory.getAddress",
                    message: "unknown owner/salt".to_string(),
                })
        }

        async fn is_registered(&self, account: Address) -> Result<bool> {
            Ok(self.registered.contains(&account))
        }

        async fn is_deployed(&self, account: Address) -> Result<bool> {
            Ok(self.deployed.contains(&account))
        }
    }

    #[test]
    fn execute_call_data_matches_known_encoding() {
        // execute(counter, 0, increment()) from the local devnet scripts
        let counter: Address = "0xCf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9".parse().unwrap();
        let data = execute_call_data(counter, U256::zero(), &Bytes::from(vec![0xd0, 0x9d, 0xe0, 0x8a]))
            .unwrap();
        assert_eq!(
            hex::encode(&data),
            "b61d27f6\
             000000000000000000000000cf7ed3acca5a467e9e704c703e8d87f634fb0fc9\
             0000000000000000000000000000000000000000000000000000000000000000\
             0000000000000000000000000000000000000000000000000000000000000060\
             0000000000000000000000000000000000000000000000000000000000000004\
             d09de08a00000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn create_account_call_data_matches_known_init_code() {
        let owner: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        let data = create_account_call_data(owner, U256::zero()).unwrap();
        assert_eq!(
            hex::encode(&data),
            "5fbfb9cf\
             000000000000000000000000f39fd6e51aad88f6f4ce6ab8827279cfffb92266\
             0000000000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn deposit_to_call_data_matches_known_encoding() {
        let paymaster: Address = "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0".parse().unwrap();
        let data = deposit_to_call_data(paymaster).unwrap();
        assert_eq!(
            hex::encode(&data),
            "b760faf9\
             0000000000000000000000009fe46736679d2d9a65f0992f2272de9f3c7fa6e0"
        );
    }

    #[test]
    fn execute_batch_encodes_two_arrays() {
        let calls = vec![
            (Address::repeat_byte(1), Bytes::from(vec![0xaa])),
            (Address::repeat_byte(2), Bytes::from(vec![0xbb, 0xcc])),
        ];
        let data = execute_batch_call_data(&calls).unwrap();
        // selector of executeBatch(address[],bytes[])
        assert_eq!(&data[..4], &ethers::utils::id("executeBatch(address[],bytes[])")[..]);
        assert!(data.len() > 4 + 64);
    }

    #[test]
    fn validation_data_unpacks_signature_failure() {
        assert!(ValidationData::from_word(U256::one()).signature_failed());
        assert!(ValidationData::from_word(U256::zero()).is_success());

        let valid_until = U256::from(0x6000_0000u64) << 160;
        let valid_after = U256::from(0x5000_0000u64) << 208;
        let data = ValidationData::from_word(valid_until + valid_after);
        assert!(data.is_success());
        assert_eq!(data.valid_until, 0x6000_0000);
        assert_eq!(data.valid_after, 0x5000_0000);
    }

    #[tokio::test]
    async fn entry_point_contract_decodes_nonce() {
        let (provider, mock) = Provider::mocked();
        mock.push::<Bytes, _>(word(U256::from(7u64))).unwrap();

        let entry_point =
            EntryPointContract::new(Address::repeat_byte(0xee), Arc::new(provider)).unwrap();
        let nonce = entry_point
            .get_nonce(Address::repeat_byte(0x01), U256::zero())
            .await
            .unwrap();
        assert_eq!(nonce, U256::from(7u64));
    }

    fn word(value: U256) -> Bytes {
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        Bytes::from(bytes.to_vec())
    }

    #[tokio::test]
    async fn smart_account_contract_decodes_nonce() {
        let (provider, mock) = Provider::mocked();
        mock.push::<Bytes, _>(word(U256::from(3u64))).unwrap();

        let account =
            SmartAccountContract::new(Address::repeat_byte(0x02), Arc::new(provider)).unwrap();
        assert_eq!(account.get_nonce().await.unwrap(), U256::from(3u64));
    }

    #[tokio::test]
    async fn simulated_validation_unpacks_signature_failure() {
        let (provider, mock) = Provider::mocked();
        mock.push::<Bytes, _>(word(U256::one())).unwrap();

        let account =
            SmartAccountContract::new(Address::repeat_byte(0x02), Arc::new(provider)).unwrap();
        let packed = crate::types::tests::sample_op().to_packed(Bytes::from(vec![0u8; 65]));
        let data = account
            .simulate_validation(&packed, H256::repeat_byte(0x11), Address::repeat_byte(0xee))
            .await
            .unwrap();
        assert!(data.signature_failed());
        assert!(!data.is_success());
    }
}
