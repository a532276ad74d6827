//! Grain handlers and the grain type registry.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::{CallContext, GrainContext};
use crate::error::GrainError;
use crate::placement::PlacementStrategy;
use crate::reminders::TickStatus;
use crate::transactions::TransactionOption;
use crate::types::{GrainId, GrainType};

/// Server side of a grain: one instance per activation.
///
/// Handlers take `&self`; activation state lives behind `Cell`/`RefCell`.
/// A non-reentrant activation never runs two handler calls at once; only
/// reentrant grains must avoid holding a borrow across an await.
#[async_trait::async_trait(?Send)]
pub trait GrainHandler {
    /// Called once, after the directory accepted the activation and before
    /// the first request.
    async fn on_activate(&self, _ctx: &GrainContext) -> Result<(), GrainError> {
        Ok(())
    }

    /// Run `method` with the encoded `body`, returning the encoded response.
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError>;

    /// Called once when the activation is torn down gracefully.
    async fn on_deactivate(&self, _ctx: &GrainContext) {}

    /// A reminder fired.
    async fn receive_reminder(
        &self,
        ctx: &GrainContext,
        name: &str,
        _status: TickStatus,
    ) -> Result<(), GrainError> {
        Err(GrainError::UnknownMethod {
            grain: ctx.grain_id().clone(),
            method: format!("reminder:{name}"),
        })
    }
}

/// Builds the handler of a new activation.
pub type GrainFactory = Rc<dyn Fn(&GrainId) -> Rc<dyn GrainHandler>>;

/// Everything the runtime knows about one grain type.
#[derive(Clone)]
pub struct GrainTypeInfo {
    name: String,
    factory: GrainFactory,
    placement: PlacementStrategy,
    reentrant: bool,
    transactions: HashMap<String, TransactionOption>,
    interleaved: Vec<String>,
}

impl fmt::Debug for GrainTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainTypeInfo")
            .field("name", &self.name)
            .field("placement", &self.placement)
            .field("reentrant", &self.reentrant)
            .field("transactions", &self.transactions)
            .field("interleaved", &self.interleaved)
            .finish()
    }
}

impl GrainTypeInfo {
    /// A non-reentrant, consistently-hashed grain type.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&GrainId) -> Rc<dyn GrainHandler> + 'static,
    {
        Self {
            name: name.into(),
            factory: Rc::new(factory),
            placement: PlacementStrategy::default(),
            reentrant: false,
            transactions: HashMap::new(),
            interleaved: Vec::new(),
        }
    }

    /// Set the placement strategy.
    pub fn with_placement(mut self, placement: PlacementStrategy) -> Self {
        self.placement = placement;
        self
    }

    /// Let requests interleave at await points.
    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Declare how `method` takes part in transactions.
    pub fn with_transaction(
        mut self,
        method: impl Into<String>,
        option: TransactionOption,
    ) -> Self {
        self.transactions.insert(method.into(), option);
        self
    }

    /// Let `method` run even while a non-reentrant turn is in progress.
    pub fn always_interleave(mut self, method: impl Into<String>) -> Self {
        self.interleaved.push(method.into());
        self
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placement strategy.
    pub fn placement(&self) -> &PlacementStrategy {
        &self.placement
    }

    /// Whether the type is reentrant.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Transaction option of `method`; `Supported` unless declared.
    pub fn transaction_option(&self, method: &str) -> TransactionOption {
        self.transactions.get(method).copied().unwrap_or_default()
    }

    /// Whether `method` is marked always-interleave.
    pub fn is_interleaved(&self, method: &str) -> bool {
        self.interleaved.iter().any(|m| m == method)
    }

    pub(crate) fn create(&self, grain: &GrainId) -> Rc<dyn GrainHandler> {
        (self.factory)(grain)
    }
}

/// Grain types a cluster can host.
#[derive(Debug, Clone, Default)]
pub struct GrainTypeRegistry {
    types: HashMap<GrainType, GrainTypeInfo>,
}

impl GrainTypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `info` under `grain_type`, replacing any earlier entry.
    pub fn register(&mut self, grain_type: GrainType, info: GrainTypeInfo) -> &mut Self {
        tracing::debug!(grain_type = %grain_type, name = %info.name, "grain type registered");
        self.types.insert(grain_type, info);
        self
    }

    /// Metadata of `grain_type`.
    pub fn get(&self, grain_type: GrainType) -> Result<&GrainTypeInfo, GrainError> {
        self.types
            .get(&grain_type)
            .ok_or(GrainError::UnknownGrainType { grain_type })
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
