//! Construction, packing, EIP-712 hashing and bundler submission of ERC-4337
//! `PackedUserOperation`s (EntryPoint v0.7/v0.8).
//!
//! The usual flow is [`builder::UserOperationBuilder`] → [`signer::sign_user_operation`] →
//! [`bundler::BundlerClient::submit`] → [`bundler::BundlerClient::poll_receipt`].

pub mod address;
pub mod builder;
pub mod bundler;
pub mod config;
pub mod contracts;
pub mod eip712;
pub mod encoding;
pub mod error;
pub mod gas;
pub mod paymaster;
pub mod signer;
pub mod types;

pub use bundler::{BundlerClient, PollConfig, ReceiptOutcome, SubmittedUserOperation};
pub use eip712::{Eip712Domain, HashVariant};
pub use error::{Error, Result, Stage};
pub use types::{OpStatus, PackedUserOperation, SignedUserOperation, UserOperation, WireFormat};
