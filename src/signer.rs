use crate::eip712::{Eip712Domain, HashVariant};
use crate::error::{Error, Result};
use crate::types::{SignedUserOperation, UserOperation};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256};

/// Produces a 65-byte ECDSA signature over a raw 32-byte digest (no EIP-191 prefix).
#[async_trait]
pub trait UserOpSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_hash(&self, hash: H256) -> Result<Bytes>;
}

#[async_trait]
impl UserOpSigner for LocalWallet {
    fn address(&self) -> Address {
        Signer::address(self)
    }

    async fn sign_hash(&self, hash: H256) -> Result<Bytes> {
        let signature = LocalWallet::sign_hash(self, hash).map_err(|e| Error::Signer(e.to_string()))?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

pub fn recover(hash: H256, signature: &[u8]) -> Result<Address> {
    let signature = Signature::try_from(signature).map_err(|e| Error::Signer(e.to_string()))?;
    signature
        .recover(hash)
        .map_err(|e| Error::Signer(e.to_string()))
}

/// Hashes `op` under `domain`/`variant`, signs the digest and freezes the result.
///
/// The signature is recovered before returning; a signer that does not sign raw digests
/// (e.g. one that applies the personal-message prefix) fails here instead of at the
/// EntryPoint with AA24.
pub async fn sign_user_operation<S>(
    op: UserOperation,
    domain: &Eip712Domain,
    variant: HashVariant,
    signer: &S,
) -> Result<SignedUserOperation>
where
    S: UserOpSigner + ?Sized,
{
    let hash = op.hash(domain, variant)?;
    let signature = signer.sign_hash(hash).await?;

    let recovered = recover(hash, &signature)?;
    if recovered != signer.address() {
        return Err(Error::Signer(format!(
            "signature over {hash:?} recovers to {recovered:?}, expected {:?}",
            signer.address()
        )));
    }

    tracing::debug!(sender = ?op.sender, user_op_hash = ?hash, "signed user operation");
    Ok(SignedUserOperation::new(op, signature, hash, *domain, variant))
}
