use crate::builder::{verify_echoed, EchoCheck};
use crate::eip712::{Eip712Domain, HashVariant};
use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity};
use crate::error::{Error, Result, Stage};
use crate::types::{OpStatus, SignedUserOperation, UserOperation, WireFormat};
use ethers::types::{Address, Bytes, H256, U256, U64};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Upper bound on a single JSON-RPC round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub paymaster_verification_gas_limit: Option<U256>,
}

/// A signed operation the bundler accepted into its mempool.
#[derive(Debug, Clone)]
pub struct SubmittedUserOperation {
    signed: SignedUserOperation,
    user_op_hash: H256,
    entry_point: Address,
}

impl SubmittedUserOperation {
    pub fn signed(&self) -> &SignedUserOperation {
        &self.signed
    }

    /// Hash reported by the bundler; receipts are indexed by this value.
    pub fn user_op_hash(&self) -> H256 {
        self.user_op_hash
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn status(&self) -> OpStatus {
        OpStatus::Submitted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    #[serde(default)]
    pub sender: Option<Address>,
    #[serde(default)]
    pub nonce: Option<U256>,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    #[serde(default)]
    pub reason: Option<String>,
    pub receipt: TransactionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_hash: H256,
    pub block_number: U64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Confirmed(UserOperationReceipt),
    /// Included on-chain, but execution reverted.
    Rejected(UserOperationReceipt),
    TimedOut {
        user_op_hash: H256,
        elapsed: Duration,
        last_error: Option<String>,
    },
}

impl ReceiptOutcome {
    pub fn status(&self) -> OpStatus {
        match self {
            ReceiptOutcome::Confirmed(_) => OpStatus::Confirmed,
            ReceiptOutcome::Rejected(_) => OpStatus::Rejected,
            ReceiptOutcome::TimedOut { .. } => OpStatus::TimedOut,
        }
    }

    pub fn receipt(&self) -> Option<&UserOperationReceipt> {
        match self {
            ReceiptOutcome::Confirmed(r) | ReceiptOutcome::Rejected(r) => Some(r),
            ReceiptOutcome::TimedOut { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    /// `Duration::ZERO` disables the deadline.
    pub timeout: Duration,
    /// Consecutive failed polls tolerated before giving up.
    pub max_retries: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            timeout: Duration::from_secs(180),
            max_retries: 3,
        }
    }
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `eth_sendUserOperation`. Never retried: a resubmission with the same nonce is either
    /// a duplicate or a replacement, and the caller has to decide which.
    pub async fn submit(
        &self,
        signed: &SignedUserOperation,
        format: WireFormat,
        entry_point: Address,
    ) -> Result<SubmittedUserOperation> {
        signed.status().advance(OpStatus::Submitted)?;

        let params = serde_json::json!([signed.to_wire(format), fmt_address(entry_point)]);
        let res = self
            .rpc(Stage::Submit, "eth_sendUserOperation", params)
            .await?;
        let user_op_hash = parse_userop_hash(&res)?;

        if user_op_hash != signed.user_op_hash() {
            tracing::warn!(
                bundler = ?user_op_hash,
                local = ?signed.user_op_hash(),
                "bundler reported a different userOpHash; check the hash variant and EntryPoint"
            );
        }
        tracing::info!(user_op_hash = ?user_op_hash, sender = ?signed.op().sender, "userOp submitted");

        Ok(SubmittedUserOperation {
            signed: signed.clone(),
            user_op_hash,
            entry_point,
        })
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let method = "eth_estimateUserOperationGas";
        let params = serde_json::json!([user_op, fmt_address(entry_point)]);
        let res = self.rpc(Stage::Submit, method, params).await?;

        Ok(GasEstimates {
            call_gas_limit: parse_u256_field(&res, method, "callGasLimit")?,
            verification_gas_limit: parse_u256_field(&res, method, "verificationGasLimit")?,
            pre_verification_gas: parse_u256_field(&res, method, "preVerificationGas")?,
            paymaster_verification_gas_limit: match res.get("paymasterVerificationGasLimit") {
                Some(Value::String(_)) => Some(parse_u256_field(
                    &res,
                    method,
                    "paymasterVerificationGasLimit",
                )?),
                _ => None,
            },
        })
    }

    /// The operation as the bundler holds it, or `None` if it does not know the hash.
    pub async fn get_user_operation_by_hash(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<(UserOperation, Bytes)>> {
        let method = "eth_getUserOperationByHash";
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self.rpc(Stage::Poll, method, params).await?;
        if res.is_null() {
            return Ok(None);
        }
        crate::encoding::user_op_from_json(&res)
            .map(Some)
            .map_err(|e| malformed(Stage::Poll, method, e))
    }

    /// Fetches the operation back from the bundler and compares it with what was signed.
    /// Runs after submission, so every failure is logged and yields `None`.
    pub async fn check_echo(
        &self,
        submitted: &SubmittedUserOperation,
        domain: &Eip712Domain,
        variant: HashVariant,
    ) -> Option<EchoCheck> {
        let signed = submitted.signed();
        let echoed = match self.get_user_operation_by_hash(submitted.user_op_hash()).await {
            Ok(Some((echoed, _))) => echoed,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(error = %e, "eth_getUserOperationByHash unavailable");
                return None;
            }
        };
        verify_echoed(signed, &echoed, domain, variant)
            .map_err(|e| tracing::warn!(error = %e, "could not check the echoed operation"))
            .ok()
    }

    pub async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let method = "eth_supportedEntryPoints";
        let res = self
            .rpc(Stage::Config, method, serde_json::json!([]))
            .await?;
        serde_json::from_value(res).map_err(|e| malformed(Stage::Config, method, e))
    }

    pub async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        self.receipt_within(user_op_hash, self.request_timeout).await
    }

    async fn receipt_within(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<Option<UserOperationReceipt>> {
        let method = "eth_getUserOperationReceipt";
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self
            .rpc_within(Stage::Poll, method, params, timeout)
            .await?;
        if res.is_null() {
            return Ok(None);
        }
        serde_json::from_value(res)
            .map(Some)
            .map_err(|e| malformed(Stage::Poll, method, e))
    }

    /// Polls for a receipt until one arrives, the deadline passes, or more than
    /// `max_retries` consecutive polls fail. Each request and each backoff sleep is cut
    /// to the time left before the deadline, so a stalled bundler cannot hold the loop
    /// past it; a request that runs out of time counts as a failed poll.
    pub async fn poll_receipt(&self, user_op_hash: H256, config: &PollConfig) -> Result<ReceiptOutcome> {
        let start = Instant::now();
        let deadline = (!config.timeout.is_zero()).then_some(config.timeout);
        let remaining = || deadline.map(|d| d.saturating_sub(start.elapsed()));
        let mut failures: u32 = 0;
        let mut last_error: Option<String> = None;

        loop {
            if remaining() == Some(Duration::ZERO) {
                tracing::warn!(user_op_hash = ?user_op_hash, timeout = ?config.timeout, "gave up waiting for receipt");
                return Ok(ReceiptOutcome::TimedOut {
                    user_op_hash,
                    elapsed: start.elapsed(),
                    last_error,
                });
            }

            let request_timeout = remaining()
                .map_or(self.request_timeout, |left| left.min(self.request_timeout));
            let delay = match self.receipt_within(user_op_hash, request_timeout).await {
                Ok(Some(receipt)) => {
                    tracing::info!(
                        user_op_hash = ?user_op_hash,
                        success = receipt.success,
                        tx = ?receipt.receipt.transaction_hash,
                        "userOp receipt"
                    );
                    return Ok(if receipt.success {
                        ReceiptOutcome::Confirmed(receipt)
                    } else {
                        ReceiptOutcome::Rejected(receipt)
                    });
                }
                Ok(None) => {
                    failures = 0;
                    config.interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(error = %e, attempt = failures, "bundler receipt poll error");
                    last_error = Some(e.to_string());
                    if failures > config.max_retries {
                        return Ok(ReceiptOutcome::TimedOut {
                            user_op_hash,
                            elapsed: start.elapsed(),
                            last_error,
                        });
                    }
                    backoff(config.interval, failures)
                }
            };

            let delay = remaining().map_or(delay, |left| delay.min(left));
            tokio::time::sleep(delay).await;
        }
    }

    async fn rpc(&self, stage: Stage, method: &str, params: Value) -> Result<Value> {
        self.rpc_within(stage, method, params, self.request_timeout)
            .await
    }

    async fn rpc_within(
        &self,
        stage: Stage,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .timeout(timeout)
            .json(&req)
            .send()
            .await
            .map_err(|e| transport(stage, method, format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport(stage, method, e))?;
        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(transport(stage, method, format!("HTTP {status}: {text}")))
            }
            Err(e) => return Err(malformed(stage, method, format!("failed to decode JSON: {e}"))),
        };

        // Bundlers report validation failures as JSON-RPC errors, sometimes with a 4xx/5xx
        // status; the error object is what matters.
        if let Some(err) = body.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(match stage {
                Stage::Poll => malformed(stage, method, format!("JSON-RPC error {code}: {message}")),
                _ => Error::BundlerRejected {
                    code,
                    message,
                    data: err.get("data").cloned(),
                },
            });
        }

        if !status.is_success() {
            return Err(transport(stage, method, format!("HTTP {status}: {body}")));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| malformed(stage, method, "missing result field"))
    }
}

/// Linear backoff, `interval × failures`, saturating instead of overflowing.
fn backoff(interval: Duration, failures: u32) -> Duration {
    interval.saturating_mul(failures)
}

fn transport(stage: Stage, method: &str, message: impl std::fmt::Display) -> Error {
    Error::Transport {
        stage,
        method: method.to_string(),
        message: message.to_string(),
    }
}

fn malformed(stage: Stage, method: &str, message: impl std::fmt::Display) -> Error {
    Error::MalformedResponse {
        stage,
        method: method.to_string(),
        message: message.to_string(),
    }
}

fn parse_u256_field(v: &Value, method: &str, key: &'static str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| malformed(Stage::Submit, method, format!("missing or invalid field {key}")))?;
    parse_u256_quantity(key, s)
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string.
    // Alchemy's docs (and sometimes responses) wrap it in an object: { "result": "0x..." }.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(malformed(
            Stage::Submit,
            "eth_sendUserOperation",
            format!("unexpected result shape (expected string or {{result: ...}}): {res}"),
        ));
    };

    parse_h256("userOpHash", hash_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eip712::tests::{debug_bundler_op, devnet_domain, ENTRY_POINT, HARDHAT_KEY};
    use crate::eip712::HashVariant;
    use crate::error::AaCategory;
    use crate::signer::sign_user_operation;
    use ethers::signers::LocalWallet;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    async fn signed_op() -> SignedUserOperation {
        let wallet: LocalWallet = HARDHAT_KEY.parse().unwrap();
        sign_user_operation(debug_bundler_op(), &devnet_domain(), HashVariant::Packed, &wallet)
            .await
            .unwrap()
    }

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    fn receipt_json(success: bool) -> Value {
        json!({
            "userOpHash": HASH,
            "sender": "0x02faffd17d2b367e437f2c331221e46217a07017",
            "nonce": "0x0",
            "success": success,
            "actualGasCost": "0x2a5d9f8c1c00",
            "actualGasUsed": "0x1d4c0",
            "reason": if success { Value::Null } else { json!("execution reverted") },
            "logs": [],
            "receipt": {
                "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                "blockNumber": "0x1a",
            }
        })
    }

    fn fast_poll(max_retries: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            max_retries,
        }
    }

    #[test]
    fn parse_userop_hash_from_string() {
        let res = json!(HASH);
        let hash = parse_userop_hash(&res).unwrap();
        assert_eq!(hash, parse_h256("userOpHash", HASH).unwrap());
    }

    #[test]
    fn parse_userop_hash_from_result_object() {
        let res = json!({ "result": HASH });
        let hash = parse_userop_hash(&res).unwrap();
        assert_eq!(hash, parse_h256("userOpHash", HASH).unwrap());
    }

    #[test]
    fn parse_userop_hash_from_userop_hash_object() {
        let res = json!({ "userOpHash": HASH });
        let hash = parse_userop_hash(&res).unwrap();
        assert_eq!(hash, parse_h256("userOpHash", HASH).unwrap());
    }

    #[test]
    fn parse_userop_hash_from_useroperation_hash_object() {
        let res = json!({ "userOperationHash": HASH });
        let hash = parse_userop_hash(&res).unwrap();
        assert_eq!(hash, parse_h256("userOpHash", HASH).unwrap());
    }

    #[test]
    fn parse_userop_hash_rejects_unknown_shape() {
        let res = json!({ "foo": "bar" });
        assert!(matches!(
            parse_userop_hash(&res),
            Err(Error::MalformedResponse { stage: Stage::Submit, .. })
        ));
    }

    #[tokio::test]
    async fn submit_posts_wire_op_and_entry_point() {
        let server = MockServer::start().await;
        let signed = signed_op().await;
        let local_hash = fmt_h256(signed.user_op_hash());

        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "eth_sendUserOperation",
                "params": [
                    {"sender": "0x02faffd17d2b367e437f2c331221e46217a07017", "nonce": "0x0"},
                    ENTRY_POINT.to_lowercase()
                ]
            })))
            .respond_with(rpc_result(json!(local_hash)))
            .expect(1)
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let submitted = client
            .submit(&signed, WireFormat::V07, ENTRY_POINT.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(submitted.user_op_hash(), signed.user_op_hash());
        assert_eq!(submitted.status(), OpStatus::Submitted);
    }

    #[tokio::test]
    async fn validation_rejection_is_surfaced_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {
                    "code": -32507,
                    "message": "Invalid UserOperation signature or paymaster signature: AA24 signature error",
                    "data": {"reason": "AA24 signature error"}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let err = client
            .submit(&signed_op().await, WireFormat::V07, ENTRY_POINT.parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BundlerRejected { code: -32507, .. }));
        assert_eq!(err.aa_code(), Some("AA24"));
        assert_eq!(err.aa_category(), Some(AaCategory::Account));
        assert_eq!(err.stage(), Stage::Submit);
    }

    #[tokio::test]
    async fn http_failure_on_submit_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(1)
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let err = client
            .submit(&signed_op().await, WireFormat::V06, ENTRY_POINT.parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { stage: Stage::Submit, .. }));
    }

    #[tokio::test]
    async fn poll_waits_through_null_receipts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getUserOperationReceipt"})))
            .respond_with(rpc_result(Value::Null))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getUserOperationReceipt"})))
            .respond_with(rpc_result(receipt_json(true)))
            .expect(1)
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let outcome = client
            .poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &fast_poll(3))
            .await
            .unwrap();

        assert_eq!(outcome.status(), OpStatus::Confirmed);
        let receipt = outcome.receipt().unwrap();
        assert_eq!(receipt.actual_gas_used, U256::from(120_000u64));
        assert_eq!(receipt.receipt.block_number, U64::from(26u64));
    }

    #[tokio::test]
    async fn failed_execution_is_rejected_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(receipt_json(false)))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let outcome = client
            .poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &fast_poll(0))
            .await
            .unwrap();
        assert_eq!(outcome.status(), OpStatus::Rejected);
        assert_eq!(
            outcome.receipt().and_then(|r| r.reason.as_deref()),
            Some("execution reverted")
        );
    }

    #[tokio::test]
    async fn transport_failures_are_retried_then_abandoned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let outcome = client
            .poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &fast_poll(2))
            .await
            .unwrap();

        match outcome {
            ReceiptOutcome::TimedOut { last_error, .. } => {
                assert!(last_error.unwrap().contains("503"));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_ends_polling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(Value::Null))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let config = PollConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(60),
            max_retries: 3,
        };
        let outcome = client
            .poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &config)
            .await
            .unwrap();
        assert_eq!(outcome.status(), OpStatus::TimedOut);
    }

    #[tokio::test]
    async fn stalled_bundler_does_not_outlive_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(Value::Null).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let config = PollConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
            max_retries: 10,
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            client.poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &config),
        )
        .await
        .expect("poll_receipt ignored its deadline")
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        match outcome {
            ReceiptOutcome::TimedOut { last_error, .. } => assert!(last_error.is_some()),
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_request_is_a_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(Value::Null).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client =
            BundlerClient::new(server.uri()).with_request_timeout(Duration::from_millis(100));
        let err = client
            .get_user_operation_receipt(parse_h256("userOpHash", HASH).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { stage: Stage::Poll, .. }));

        // No deadline: the retry budget alone ends the poll.
        let config = PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::ZERO,
            max_retries: 1,
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            client.poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &config),
        )
        .await
        .expect("retry budget did not end the poll")
        .unwrap();
        assert_eq!(outcome.status(), OpStatus::TimedOut);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let interval = Duration::from_millis(20);
        assert_eq!(backoff(interval, 3), Duration::from_millis(60));
        assert_eq!(backoff(Duration::MAX, 2), Duration::MAX);
        assert_eq!(backoff(Duration::from_secs(u64::MAX / 2 + 1), 2), Duration::MAX);
    }

    #[tokio::test]
    async fn huge_interval_is_cut_to_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let config = PollConfig {
            interval: Duration::from_secs(u64::MAX / 4),
            timeout: Duration::from_millis(100),
            max_retries: 5,
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            client.poll_receipt(parse_h256("userOpHash", HASH).unwrap(), &config),
        )
        .await
        .expect("backoff sleep ignored the deadline")
        .unwrap();
        assert_eq!(outcome.status(), OpStatus::TimedOut);
    }

    #[tokio::test]
    async fn fetches_echoed_operation_and_entry_points() {
        let server = MockServer::start().await;
        let signed = signed_op().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getUserOperationByHash"})))
            .respond_with(rpc_result(json!({
                "userOperation": signed.to_wire(WireFormat::V07),
                "entryPoint": ENTRY_POINT,
                "transactionHash": null,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_supportedEntryPoints"})))
            .respond_with(rpc_result(json!([ENTRY_POINT])))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let (echoed, signature) = client
            .get_user_operation_by_hash(signed.user_op_hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, signed.op());
        assert_eq!(&signature, signed.signature());

        let entry_points = client.supported_entry_points().await.unwrap();
        assert_eq!(entry_points, vec![ENTRY_POINT.parse::<Address>().unwrap()]);
    }

    fn accepted(signed: SignedUserOperation) -> SubmittedUserOperation {
        SubmittedUserOperation {
            user_op_hash: signed.user_op_hash(),
            signed,
            entry_point: ENTRY_POINT.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn echo_check_reports_mutated_paymaster_data() {
        let server = MockServer::start().await;
        let submitted = accepted(signed_op().await);

        let mut mutated = submitted.signed().op().clone();
        if let Some(pm) = mutated.paymaster.as_mut() {
            pm.post_op_gas_limit += 1;
        }
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getUserOperationByHash"})))
            .respond_with(rpc_result(json!({
                "userOperation": crate::encoding::user_op_to_json(
                    &mutated,
                    submitted.signed().signature(),
                    WireFormat::V07,
                ),
                "entryPoint": ENTRY_POINT,
            })))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let check = client
            .check_echo(&submitted, &devnet_domain(), HashVariant::Packed)
            .await
            .unwrap();
        assert!(!check.unchanged());
        assert_eq!(check.signed_hash, submitted.user_op_hash());
        assert_ne!(check.echoed_recovers_to, check.signed_recovers_to);
    }

    #[tokio::test]
    async fn echo_check_failures_do_not_stop_receipt_polling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getUserOperationByHash"})))
            .respond_with(rpc_result(json!({"userOperation": {"sender": "0x1234"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_getUserOperationReceipt"})))
            .respond_with(rpc_result(receipt_json(true)))
            .expect(1)
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let submitted = accepted(signed_op().await);
        let check = client
            .check_echo(&submitted, &devnet_domain(), HashVariant::Packed)
            .await;
        assert!(check.is_none());

        let outcome = client
            .poll_receipt(submitted.user_op_hash(), &fast_poll(0))
            .await
            .unwrap();
        assert_eq!(outcome.status(), OpStatus::Confirmed);
    }

    #[tokio::test]
    async fn estimate_parses_quantities() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_estimateUserOperationGas"})))
            .respond_with(rpc_result(json!({
                "callGasLimit": "0x30d40",
                "verificationGasLimit": "0x186a0",
                "preVerificationGas": "0xc350",
            })))
            .mount(&server)
            .await;

        let client = BundlerClient::new(server.uri());
        let estimates = client
            .estimate_user_operation_gas(
                signed_op().await.to_wire(WireFormat::V07),
                ENTRY_POINT.parse().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(estimates.call_gas_limit, U256::from(200_000u64));
        assert_eq!(estimates.pre_verification_gas, U256::from(50_000u64));
        assert_eq!(estimates.paymaster_verification_gas_limit, None);
    }
}
