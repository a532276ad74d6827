//! Typed handle for calling a grain by identity.

use std::fmt;
use std::rc::Weak;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{GrainCancellationToken, Silo};
use crate::codec;
use crate::error::GrainError;
use crate::transactions::TransactionContext;
use crate::types::{GrainId, SiloAddress};

/// Reference to a grain. Holding one never activates anything; the first
/// call does.
///
/// # Example
///
/// ```rust,ignore
/// let account = silo.grain(ACCOUNT, "alice");
/// let balance: u64 = account.call("balance", &()).await?;
/// ```
#[derive(Clone)]
pub struct GrainRef {
    grain: GrainId,
    silo: Weak<Silo>,
    origin: SiloAddress,
    transaction: Option<TransactionContext>,
    cancellation: Option<GrainCancellationToken>,
}

impl fmt::Debug for GrainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainRef")
            .field("grain", &self.grain)
            .field("origin", &self.origin)
            .field("transaction", &self.transaction.as_ref().map(|t| t.borrow().id))
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl GrainRef {
    pub(crate) fn new(grain: GrainId, silo: Weak<Silo>, origin: SiloAddress) -> Self {
        Self {
            grain,
            silo,
            origin,
            transaction: None,
            cancellation: None,
        }
    }

    pub(crate) fn with_transaction(mut self, transaction: Option<TransactionContext>) -> Self {
        self.transaction = transaction;
        self
    }

    /// Attach a cancellation token to every call made through this reference.
    pub fn with_cancellation(mut self, token: GrainCancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The target grain.
    pub fn grain_id(&self) -> &GrainId {
        &self.grain
    }

    /// Call `method` with `request`, decoding the response as `Resp`.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, GrainError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = codec::encode(request)?;
        let response = self.call_raw(method, body).await?;
        codec::decode(&response)
    }

    /// Call `method` with an already encoded body.
    pub async fn call_raw(&self, method: &str, body: Vec<u8>) -> Result<Vec<u8>, GrainError> {
        let silo = self.silo.upgrade().ok_or_else(|| GrainError::SiloStopped {
            silo: self.origin.clone(),
        })?;
        silo.call_grain(
            &self.grain,
            method,
            body,
            self.transaction.as_ref(),
            self.cancellation.clone(),
        )
        .await
    }
}
