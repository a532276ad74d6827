//! Per-method transaction requirements.

use serde::{Deserialize, Serialize};

use super::{TransactionContext, TransactionError};

/// How a method relates to the caller's ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionOption {
    /// Not transactional; the ambient transaction is not passed on.
    Suppress,
    /// Join the ambient transaction, or start one.
    CreateOrJoin,
    /// Always start a new transaction.
    Create,
    /// Join the ambient transaction; fail without one.
    Join,
    /// Not transactional, but the ambient transaction is passed on.
    #[default]
    Supported,
    /// Not transactional; fail inside a transaction.
    NotAllowed,
}

/// What a call does with transactions once its option is applied.
#[derive(Debug, Clone)]
pub enum TransactionScope {
    /// The callee runs outside any transaction.
    None,
    /// The callee runs inside the caller's transaction.
    Ambient(TransactionContext),
    /// The callee starts (and resolves) a new transaction.
    New,
}

impl TransactionOption {
    /// Alias of [`CreateOrJoin`](Self::CreateOrJoin).
    pub const REQUIRED: Self = Self::CreateOrJoin;
    /// Alias of [`Create`](Self::Create).
    pub const REQUIRES_NEW: Self = Self::Create;
    /// Alias of [`Join`](Self::Join).
    pub const MANDATORY: Self = Self::Join;
    /// Alias of [`NotAllowed`](Self::NotAllowed).
    pub const NEVER: Self = Self::NotAllowed;

    /// Whether the callee body runs inside a transaction.
    pub fn is_transactional(self) -> bool {
        matches!(self, Self::CreateOrJoin | Self::Create | Self::Join)
    }

    /// Apply this option to the caller's `ambient` transaction.
    pub fn resolve(
        self,
        ambient: Option<&TransactionContext>,
    ) -> Result<TransactionScope, TransactionError> {
        match (self, ambient) {
            (Self::Suppress, _) => Ok(TransactionScope::None),
            (Self::Create, _) => Ok(TransactionScope::New),
            (Self::CreateOrJoin, Some(ctx))
            | (Self::Join, Some(ctx))
            | (Self::Supported, Some(ctx)) => {
                Ok(TransactionScope::Ambient(ctx.clone()))
            }
            (Self::CreateOrJoin, None) => Ok(TransactionScope::New),
            (Self::Join, None) => Err(TransactionError::NotSupported {
                reason: "call cannot be made outside of a transaction".into(),
            }),
            (Self::Supported, None) | (Self::NotAllowed, None) => Ok(TransactionScope::None),
            (Self::NotAllowed, Some(_)) => Err(TransactionError::NotSupported {
                reason: "call cannot be made within a transaction".into(),
            }),
        }
    }
}
