//! Grain runtime: silos, activations, and the grain-call surface.
//!
//! A [`Silo`] ties the subsystems together for one process-local member of
//! the cluster: membership oracle and failure detector, grain directory,
//! activation catalog, transaction coordinator, and reminder service.
//!
//! # Design
//!
//! - **Registry, not reflection**: grain types are registered up front in a
//!   [`GrainTypeRegistry`] mapping a [`GrainType`](crate::types::GrainType)
//!   tag to a factory and per-type metadata (placement, reentrancy,
//!   per-method [`TransactionOption`](crate::transactions::TransactionOption)).
//! - **Turn-based activations**: each activation owns a mailbox drained by
//!   one local task. A non-reentrant activation finishes a request before
//!   taking the next; a reentrant one interleaves requests at await points.
//! - **Register, then activate**: an activation becomes visible only after
//!   the directory accepted it. The loser of a registration race never runs
//!   `on_activate`; it forwards what it queued to the winner.
//! - **Explicit context**: handlers receive a [`CallContext`] carrying the
//!   ambient transaction and cancellation token, and a [`GrainContext`]
//!   for the activation. Nothing is stored in task-local or global state.
//! - **No cycles**: activations and contexts hold `Weak<Silo>`; the silo owns
//!   everything else.

mod activation;
mod cancellation;
mod catalog;
mod config;
mod context;
mod grain_ref;
mod handler;
mod message;
mod silo;

pub use cancellation::GrainCancellationToken;
pub use config::{
    ClusterConfig, ClusterConfigBuilder, ClusterConfigError, RuntimeOptions, SiloConfig,
    SiloConfigBuilder,
};
pub use context::{CallContext, GrainContext};
pub use grain_ref::GrainRef;
pub use handler::{GrainFactory, GrainHandler, GrainTypeInfo, GrainTypeRegistry};
pub use message::{
    CacheInvalidation, DetailedGrainStatistic, InvokeKind, InvokeRequest, InvokeResponse,
};
pub use silo::{Silo, SiloState};
