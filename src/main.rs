use aa_userop::builder::{self, CallSpec, GasSettings, SenderSpec, UserOperationBuilder};
use aa_userop::bundler::{BundlerClient, PollConfig, ReceiptOutcome};
use aa_userop::config::{load_deployment, Deployment, Overrides};
use aa_userop::contracts::{
    AccountFactoryContract, AccountFactoryReader, EntryPointContract, EntryPointReader,
    SmartAccountContract, SmartAccountReader,
};
use aa_userop::encoding::{self, parse_bytes, parse_h256, parse_u256_quantity};
use aa_userop::paymaster;
use aa_userop::{gas, HashVariant, UserOperation};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// In --json mode stdout carries exactly one JSON document; everything human-readable goes
// to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "aa-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address, deployment and registration status.
    Account(AccountArgs),

    /// Build a UserOperation and compare the local EIP-712 hash with EntryPoint.getUserOpHash.
    Hash(OpArgs),

    /// Build, sign, verify and submit a UserOperation, then wait for its receipt.
    Send(SendArgs),

    /// Wait for the receipt of an already submitted userOpHash.
    Receipt(ReceiptArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Network file (chainId, rpc, bundler, entryPoint, factory, paymaster, hashVariant, wireFormat).
    #[arg(long, env = "AA_USEROP_NETWORK", default_value = "networks/anvil.json")]
    network: PathBuf,

    /// Override the chain RPC URL (otherwise uses the network file).
    #[arg(long, env = "AA_USEROP_RPC_URL")]
    rpc: Option<String>,

    /// Override the bundler URL (otherwise uses the network file).
    #[arg(long, env = "AA_USEROP_BUNDLER_URL")]
    bundler: Option<String>,

    /// Override the EIP-712 struct layout: `packed` or `unpacked-legacy`.
    #[arg(long, env = "AA_USEROP_HASH_VARIANT")]
    hash_variant: Option<HashVariant>,

    /// Smart account owner private key.
    #[arg(long, env = "AA_USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: Option<String>,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,

    /// keccak256 of the account proxy init code. When set, the factory's address is
    /// cross-checked against a local CREATE2 prediction.
    #[arg(long, env = "AA_USEROP_PROXY_INIT_CODE_HASH")]
    proxy_init_code_hash: Option<String>,

    /// Print a single JSON object to stdout; logs go to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl CommonArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            rpc: self.rpc.clone(),
            bundler: self.bundler.clone(),
            hash_variant: self.hash_variant,
        }
    }
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct OpArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Use this already deployed account instead of the counterfactual one.
    #[arg(long)]
    sender: Option<String>,

    /// Call target for `execute(to, value, data)`. Without it the op only deploys the account.
    #[arg(long)]
    to: Option<String>,

    /// Wei sent with the call (hex quantity or decimal).
    #[arg(long, default_value = "0")]
    value: String,

    /// Inner calldata for `execute`.
    #[arg(long, default_value = "0x")]
    data: String,

    /// Raw account calldata; bypasses `execute` encoding.
    #[arg(long, conflicts_with = "to")]
    call_data: Option<String>,

    /// Sponsor gas with the paymaster from the network file.
    #[arg(long, default_value_t = false)]
    sponsor: bool,

    /// 192-bit nonce key.
    #[arg(long, default_value = "0")]
    nonce_key: String,

    #[arg(long)]
    verification_gas_limit: Option<String>,

    #[arg(long)]
    call_gas_limit: Option<String>,

    #[arg(long)]
    pre_verification_gas: Option<String>,

    #[arg(long)]
    max_priority_fee_per_gas: Option<String>,

    #[arg(long)]
    max_fee_per_gas: Option<String>,

    #[arg(long)]
    paymaster_verification_gas_limit: Option<String>,

    #[arg(long)]
    paymaster_post_op_gas_limit: Option<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    op: OpArgs,

    /// Ask the bundler for gas limits (eth_estimateUserOperationGas) before signing.
    #[arg(long, default_value_t = false)]
    estimate: bool,

    /// Skip the EntryPoint.getUserOpHash cross-check.
    #[arg(long, default_value_t = false)]
    skip_hash_check: bool,

    /// Do not send the UserOperation; print the signed wire JSON instead.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args, Debug)]
struct ReceiptArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long)]
    user_op_hash: String,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args, Debug)]
struct PollArgs {
    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,

    #[arg(long, default_value_t = 1500)]
    poll_interval_ms: u64,

    /// Consecutive failed receipt polls tolerated before giving up.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
}

impl From<&PollArgs> for PollConfig {
    fn from(args: &PollArgs) -> Self {
        Self {
            interval: Duration::from_millis(args.poll_interval_ms),
            timeout: Duration::from_secs(args.max_wait_seconds),
            max_retries: args.max_retries,
        }
    }
}

type Client = Provider<Http>;

/// Everything a command needs once the network file is loaded and the RPC is verified.
struct Session {
    dep: Deployment,
    provider: Arc<Client>,
    entry_point: EntryPointContract<Client>,
    factory: AccountFactoryContract<Client>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Hash(args) => cmd_hash(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Receipt(args) => cmd_receipt(args).await,
    }
}

async fn connect(common: &CommonArgs) -> Result<Session> {
    let dep = load_deployment(&common.network, &common.overrides())?;

    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != dep.network.chain_id {
        return Err(anyhow!(
            "chainId mismatch: network file has {}, RPC returned {}",
            dep.network.chain_id,
            chain_id
        ));
    }

    let provider = Arc::new(provider);
    let entry_point = EntryPointContract::new(dep.network.entry_point, provider.clone())?;
    let factory = AccountFactoryContract::new(dep.network.factory, provider.clone())?;
    Ok(Session {
        dep,
        provider,
        entry_point,
        factory,
    })
}

fn load_owner(common: &CommonArgs, chain_id: u64) -> Result<LocalWallet> {
    let owner_pk = common
        .owner_private_key
        .clone()
        .ok_or_else(|| anyhow!("missing AA_USEROP_OWNER_PRIVATE_KEY (or --owner-private-key)"))?;
    let wallet = LocalWallet::from_str(&owner_pk).context("invalid owner private key")?;
    Ok(wallet.with_chain_id(chain_id))
}

fn sender_spec(common: &CommonArgs, sender: Option<&str>, owner: Address) -> Result<SenderSpec> {
    if let Some(s) = sender {
        let addr = Address::from_str(s).context("invalid --sender address")?;
        return Ok(SenderSpec::Existing(addr));
    }
    let init_code_hash = common
        .proxy_init_code_hash
        .as_deref()
        .map(|h| parse_h256("proxyInitCodeHash", h))
        .transpose()?;
    Ok(SenderSpec::Counterfactual {
        owner,
        salt: U256::from(common.salt),
        init_code_hash,
    })
}

fn parse_quantity(field: &'static str, s: &str) -> Result<U256> {
    if s.starts_with("0x") {
        Ok(parse_u256_quantity(field, s)?)
    } else {
        U256::from_dec_str(s).with_context(|| format!("invalid {field}: {s}"))
    }
}

fn opt_quantity(field: &'static str, s: &Option<String>) -> Result<Option<U256>> {
    s.as_deref().map(|v| parse_quantity(field, v)).transpose()
}

fn call_spec(args: &OpArgs) -> Result<CallSpec> {
    if let Some(raw) = args.call_data.as_deref() {
        return Ok(CallSpec::Raw(parse_bytes("callData", raw)?));
    }
    match args.to.as_deref() {
        None => Ok(CallSpec::None),
        Some(to) => Ok(CallSpec::Execute {
            target: Address::from_str(to).context("invalid --to address")?,
            value: parse_quantity("value", &args.value)?,
            data: parse_bytes("data", &args.data)?,
        }),
    }
}

fn gas_settings(args: &OpArgs) -> Result<GasSettings> {
    Ok(GasSettings {
        verification_gas_limit: opt_quantity("verificationGasLimit", &args.verification_gas_limit)?,
        call_gas_limit: opt_quantity("callGasLimit", &args.call_gas_limit)?,
        pre_verification_gas: opt_quantity("preVerificationGas", &args.pre_verification_gas)?,
        max_priority_fee_per_gas: opt_quantity(
            "maxPriorityFeePerGas",
            &args.max_priority_fee_per_gas,
        )?,
        max_fee_per_gas: opt_quantity("maxFeePerGas", &args.max_fee_per_gas)?,
        paymaster_verification_gas_limit: opt_quantity(
            "paymasterVerificationGasLimit",
            &args.paymaster_verification_gas_limit,
        )?,
        paymaster_post_op_gas_limit: opt_quantity(
            "paymasterPostOpGasLimit",
            &args.paymaster_post_op_gas_limit,
        )?,
    })
}

fn bundler_client(dep: &Deployment) -> Result<BundlerClient> {
    let url = dep
        .bundler_url
        .clone()
        .ok_or_else(|| anyhow!("no bundler URL: set `bundler` in the network file or pass --bundler"))?;
    Ok(BundlerClient::new(url))
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let ctx = connect(&args.common).await?;
    let wallet = load_owner(&args.common, ctx.dep.network.chain_id)?;
    let owner = wallet.address();

    let builder = UserOperationBuilder::new(&ctx.dep.network, &ctx.entry_point, &ctx.factory);
    let resolved = builder
        .resolve_sender(&sender_spec(&args.common, None, owner)?)
        .await
        .context("failed to resolve smart account address")?;
    let account = resolved.address;

    let registered = ctx
        .factory
        .is_registered(account)
        .await
        .context("factory.isRegistedAccount failed")?;
    let nonce = ctx
        .entry_point
        .get_nonce(account, U256::zero())
        .await
        .context("entryPoint.getNonce failed")?;
    let deposit = ctx
        .entry_point
        .balance_of(account)
        .await
        .context("entryPoint.balanceOf failed")?;

    let mut account_owner = None;
    if resolved.deployed() {
        let sa = SmartAccountContract::new(account, ctx.provider.clone())?;
        let on_chain_owner = sa.owner().await.context("account.owner failed")?;
        let on_chain_entry_point = sa.entry_point().await.context("account.entryPoint failed")?;
        let account_nonce = sa.get_nonce().await.context("account.getNonce failed")?;
        if account_nonce != nonce {
            tracing::warn!(
                entry_point = %nonce,
                account = %account_nonce,
                "account.getNonce disagrees with EntryPoint.getNonce(sender, 0)"
            );
        }
        if on_chain_owner != owner {
            tracing::warn!(expected = ?owner, actual = ?on_chain_owner, "account owner differs from the signing key");
        }
        if on_chain_entry_point != ctx.dep.network.entry_point {
            tracing::warn!(
                configured = ?ctx.dep.network.entry_point,
                account = ?on_chain_entry_point,
                "account is bound to a different EntryPoint"
            );
        }
        account_owner = Some(on_chain_owner);
    }

    let paymaster_deposit = match ctx.dep.network.paymaster {
        Some(pm) => Some(
            ctx.entry_point
                .balance_of(pm)
                .await
                .context("entryPoint.balanceOf(paymaster) failed")?,
        ),
        None => None,
    };

    if machine_mode {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(owner),
            "smartAccount": encoding::fmt_address(account),
            "isDeployed": resolved.deployed(),
            "isRegistered": registered,
            "nonce": encoding::fmt_u256(nonce),
            "deposit": encoding::fmt_u256(deposit),
            "paymasterDeposit": paymaster_deposit.map(encoding::fmt_u256),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:          {}", ctx.dep.network.chain_id);
    outln!(machine_mode, "entryPoint:       {:?}", ctx.dep.network.entry_point);
    outln!(machine_mode, "factory:          {:?}", ctx.dep.network.factory);
    outln!(machine_mode, "owner:            {:?}", owner);
    outln!(machine_mode, "smartAccount:     {:?}", account);
    outln!(machine_mode, "isDeployed:       {}", resolved.deployed());
    if let Some(o) = account_owner {
        outln!(machine_mode, "accountOwner:     {:?}", o);
    }
    outln!(machine_mode, "isRegistered:     {}", registered);
    outln!(machine_mode, "nonce:            {}", nonce);
    outln!(machine_mode, "deposit:          {}", deposit);
    if let Some(d) = paymaster_deposit {
        outln!(machine_mode, "paymasterDeposit: {}", d);
    }

    Ok(())
}

async fn build_op(
    ctx: &Session,
    args: &OpArgs,
    owner: Address,
) -> Result<UserOperation> {
    let builder = UserOperationBuilder::new(&ctx.dep.network, &ctx.entry_point, &ctx.factory)
        .with_nonce_key(parse_quantity("nonceKey", &args.nonce_key)?);
    let op = builder
        .build(
            &sender_spec(&args.common, args.sender.as_deref(), owner)?,
            &call_spec(args)?,
            &gas_settings(args)?,
            args.sponsor,
        )
        .await
        .context("failed to build user operation")?;
    Ok(op)
}

async fn cmd_hash(args: OpArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let ctx = connect(&args.common).await?;
    let wallet = load_owner(&args.common, ctx.dep.network.chain_id)?;
    let variant = ctx.dep.hash_variant;

    let op = build_op(&ctx, &args, wallet.address()).await?;
    let builder = UserOperationBuilder::new(&ctx.dep.network, &ctx.entry_point, &ctx.factory);
    let domain = builder.domain();

    let local = op.hash(&domain, variant)?;
    let on_chain = ctx
        .entry_point
        .get_user_op_hash(&op.to_packed(Bytes::default()))
        .await
        .context("entryPoint.getUserOpHash failed")?;

    if machine_mode {
        let out = serde_json::json!({
            "variant": variant,
            "domainSeparator": encoding::fmt_h256(domain.domain_separator()),
            "typeHash": encoding::fmt_h256(variant.type_hash()),
            "localHash": encoding::fmt_h256(local),
            "entryPointHash": encoding::fmt_h256(on_chain),
            "match": local == on_chain,
            "userOp": encoding::user_op_to_json(&op, &[], ctx.dep.wire_format),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "variant:          {}", variant);
    outln!(machine_mode, "typeString:       {}", variant.type_string());
    outln!(machine_mode, "domainSeparator:  {:?}", domain.domain_separator());
    outln!(machine_mode, "sender:           {:?}", op.sender);
    outln!(machine_mode, "nonce:            {}", op.nonce);
    outln!(machine_mode, "initCode:         {}", encoding::fmt_bytes(&op.init_code()));
    outln!(machine_mode, "callData:         {}", encoding::fmt_bytes(&op.call_data));
    outln!(machine_mode, "accountGasLimits: {:?}", op.account_gas_limits());
    outln!(machine_mode, "gasFees:          {:?}", op.gas_fees());
    outln!(
        machine_mode,
        "paymasterAndData: {}",
        encoding::fmt_bytes(&op.paymaster_and_data())
    );
    outln!(machine_mode, "localHash:        {:?}", local);
    outln!(machine_mode, "entryPointHash:   {:?}", on_chain);

    if local != on_chain {
        return Err(anyhow!(aa_userop::Error::HashMismatch {
            expected: on_chain,
            computed: local,
        }));
    }
    outln!(machine_mode, "hashes match");
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let common = &args.op.common;
    let machine_mode = common.json;
    let ctx = connect(common).await?;
    let wallet = load_owner(common, ctx.dep.network.chain_id)?;
    let variant = ctx.dep.hash_variant;
    let format = ctx.dep.wire_format;

    let mut op = build_op(&ctx, &args.op, wallet.address()).await?;

    if args.estimate {
        let bundler = bundler_client(&ctx.dep)?;
        // Bundlers simulate with a dummy signature of the right length.
        let stub = encoding::user_op_to_json(&op, &[0xff; 65], format);
        let est = bundler
            .estimate_user_operation_gas(stub, ctx.dep.network.entry_point)
            .await
            .context("bundler gas estimate failed")?;
        op.call_gas_limit = gas::to_u128("callGasLimit", est.call_gas_limit)?;
        op.verification_gas_limit = gas::to_u128("verificationGasLimit", est.verification_gas_limit)?;
        op.pre_verification_gas = est.pre_verification_gas;
        if let (Some(pm), Some(limit)) = (op.paymaster.as_mut(), est.paymaster_verification_gas_limit) {
            pm.verification_gas_limit = gas::to_u128("paymasterVerificationGasLimit", limit)?;
        }
        tracing::info!(?est, "applied bundler gas estimates");
    }

    if let Some(pm) = &op.paymaster {
        // Sanity check on what actually goes on the wire.
        let decoded = paymaster::decode(&op.paymaster_and_data())?;
        tracing::debug!(paymaster = ?pm.paymaster, len = op.paymaster_and_data().len(), ?decoded, "paymasterAndData");
    }

    let builder = UserOperationBuilder::new(&ctx.dep.network, &ctx.entry_point, &ctx.factory);
    let signed = builder
        .sign(op, variant, &wallet)
        .await
        .context("failed to sign user operation")?;

    if !args.skip_hash_check {
        builder::verify_hash(&ctx.entry_point, &signed)
            .await
            .context("local userOpHash does not match EntryPoint.getUserOpHash; check hashVariant and chainId")?;
    }

    // A deployed account can be asked directly whether it accepts the signature.
    if signed.op().factory.is_none() {
        let account = SmartAccountContract::new(signed.op().sender, ctx.provider.clone())?;
        match account
            .simulate_validation(
                &signed.to_packed(),
                signed.user_op_hash(),
                ctx.dep.network.entry_point,
            )
            .await
        {
            Ok(v) if v.signature_failed() => {
                return Err(anyhow!(
                    "account.validateUserOp rejects the signature (SIG_VALIDATION_FAILED); not sending"
                ));
            }
            Ok(v) => tracing::debug!(?v, "account.validateUserOp"),
            Err(e) => tracing::warn!(error = %e, "could not simulate account.validateUserOp"),
        }
    }

    if args.dry_run {
        let wire = signed.to_wire(format);
        if machine_mode {
            println!("{}", wire);
        } else {
            println!("{}", serde_json::to_string_pretty(&wire)?);
        }
        eprintln!("--dry-run set: not sending UserOperation.");
        return Ok(());
    }

    let bundler = bundler_client(&ctx.dep)?;
    let submitted = bundler
        .submit(&signed, format, ctx.dep.network.entry_point)
        .await
        .context("bundler send failed")?;
    let user_op_hash = submitted.user_op_hash();
    outln!(machine_mode, "userOpHash: {}", encoding::fmt_h256(user_op_hash));

    if let Some(check) = bundler.check_echo(&submitted, &builder.domain(), variant).await {
        tracing::debug!(unchanged = check.unchanged(), "bundler echo check");
    }

    if args.no_wait {
        outln!(machine_mode, "--no-wait set: not waiting for receipt.");
        if machine_mode {
            println!("{}", serde_json::json!({ "userOpHash": encoding::fmt_h256(user_op_hash) }));
        }
        return Ok(());
    }

    let outcome = bundler
        .poll_receipt(user_op_hash, &PollConfig::from(&args.poll))
        .await
        .context("failed waiting for userOp receipt")?;
    report_outcome(machine_mode, outcome)
}

async fn cmd_receipt(args: ReceiptArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let dep = load_deployment(&args.common.network, &args.common.overrides())?;
    let bundler = bundler_client(&dep)?;
    let user_op_hash = parse_h256("userOpHash", &args.user_op_hash)?;

    let outcome = bundler
        .poll_receipt(user_op_hash, &PollConfig::from(&args.poll))
        .await
        .context("failed waiting for userOp receipt")?;
    report_outcome(machine_mode, outcome)
}

fn report_outcome(machine_mode: bool, outcome: ReceiptOutcome) -> Result<()> {
    if machine_mode {
        if let Some(receipt) = outcome.receipt() {
            println!("{}", serde_json::to_string(receipt)?);
        }
    }

    match outcome {
        ReceiptOutcome::Confirmed(receipt) => {
            outln!(machine_mode, "status:        {}", aa_userop::OpStatus::Confirmed);
            outln!(machine_mode, "transaction:   {:?}", receipt.receipt.transaction_hash);
            outln!(machine_mode, "block:         {}", receipt.receipt.block_number);
            outln!(machine_mode, "actualGasUsed: {}", receipt.actual_gas_used);
            outln!(machine_mode, "actualGasCost: {}", receipt.actual_gas_cost);
            Ok(())
        }
        ReceiptOutcome::Rejected(receipt) => Err(anyhow!(
            "userOp {:?} was included in {:?} but execution reverted: {}",
            receipt.user_op_hash,
            receipt.receipt.transaction_hash,
            receipt.reason.as_deref().unwrap_or("no reason given")
        )),
        ReceiptOutcome::TimedOut {
            user_op_hash,
            elapsed,
            last_error,
        } => Err(anyhow!(
            "timed out waiting for userOp {:?} receipt after {:?}{}",
            user_op_hash,
            elapsed,
            last_error.map(|e| format!(" (last error: {e})")).unwrap_or_default()
        )),
    }
}
