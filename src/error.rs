use ethers::types::{Address, H256, U256};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Config,
    Encode,
    Hash,
    Sign,
    Submit,
    Poll,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Config => "config",
            Stage::Encode => "encode",
            Stage::Hash => "hash",
            Stage::Sign => "sign",
            Stage::Submit => "submit",
            Stage::Poll => "poll",
        };
        f.write_str(s)
    }
}

/// ERC-4337 validation error families, keyed by the `AAxy` prefix the EntryPoint uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AaCategory {
    /// AA1x: factory / initCode
    Factory,
    /// AA2x: account validation (signature, nonce, prefund)
    Account,
    /// AA3x: paymaster validation
    Paymaster,
    /// AA4x: gas limits
    Gas,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("[encode] {field} = {value} exceeds 128 bits")]
    ValueOutOfRange { field: &'static str, value: U256 },

    #[error("[encode] paymasterAndData too short: expected at least {expected_min} bytes, got {actual}")]
    MalformedPaymasterData { expected_min: usize, actual: usize },

    #[error("[encode] initCode too short: expected 0 or at least 20 bytes, got {actual}")]
    MalformedInitCode { actual: usize },

    #[error("[encode] invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("[hash] field {field} has shape {found} but the {expected} struct layout requires otherwise")]
    VariantMismatch {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("[hash] userOpHash mismatch: EntryPoint returned {expected:?}, computed {computed:?}")]
    HashMismatch { expected: H256, computed: H256 },

    #[error("[config] counterfactual address mismatch: predicted {predicted:?}, factory reported {reported:?}")]
    AddressMismatch { predicted: Address, reported: Address },

    #[error("[config] sender {sender:?} is not registered with the account factory; the paymaster will reject it")]
    SenderNotRegistered { sender: Address },

    #[error("[config] {0}")]
    Config(String),

    #[error("[sign] {0}")]
    Signer(String),

    #[error("[submit] bundler rejected operation ({code}): {message}")]
    BundlerRejected {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("[{stage}] {method} transport failure: {message}")]
    Transport {
        stage: Stage,
        method: String,
        message: String,
    },

    #[error("[{stage}] {method} returned an unexpected response: {message}")]
    MalformedResponse {
        stage: Stage,
        method: String,
        message: String,
    },

    #[error("[{stage}] {call} failed: {message}")]
    Collaborator {
        stage: Stage,
        call: &'static str,
        message: String,
    },

    #[error("[{stage}] invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        stage: Stage,
        from: &'static str,
        to: &'static str,
    },
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::ValueOutOfRange { .. }
            | Error::MalformedPaymasterData { .. }
            | Error::MalformedInitCode { .. }
            | Error::InvalidField { .. } => Stage::Encode,
            Error::VariantMismatch { .. } | Error::HashMismatch { .. } => Stage::Hash,
            Error::AddressMismatch { .. } | Error::SenderNotRegistered { .. } | Error::Config(_) => {
                Stage::Config
            }
            Error::Signer(_) => Stage::Sign,
            Error::BundlerRejected { .. } => Stage::Submit,
            Error::Transport { stage, .. }
            | Error::MalformedResponse { stage, .. }
            | Error::Collaborator { stage, .. }
            | Error::InvalidTransition { stage, .. } => *stage,
        }
    }

    /// The `AAxy` code a bundler embeds in its rejection message, if any.
    pub fn aa_code(&self) -> Option<&str> {
        match self {
            Error::BundlerRejected { message, .. } => find_aa_code(message),
            _ => None,
        }
    }

    pub fn aa_category(&self) -> Option<AaCategory> {
        self.aa_code().map(categorize)
    }

    pub(crate) fn invalid_field(field: &'static str, message: impl fmt::Display) -> Self {
        Error::InvalidField {
            field,
            message: message.to_string(),
        }
    }
}

fn find_aa_code(message: &str) -> Option<&str> {
    let bytes = message.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let candidate = &bytes[i..i + 4];
        let is_code = candidate[0] == b'A'
            && candidate[1] == b'A'
            && candidate[2].is_ascii_digit()
            && candidate[3].is_ascii_digit();
        let boundary = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        (is_code && boundary).then(|| &message[i..i + 4])
    })
}

fn categorize(code: &str) -> AaCategory {
    match code.as_bytes().get(2) {
        Some(b'1') => AaCategory::Factory,
        Some(b'2') => AaCategory::Account,
        Some(b'3') => AaCategory::Paymaster,
        Some(b'4') => AaCategory::Gas,
        _ => AaCategory::Other,
    }
}
