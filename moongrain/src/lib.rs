//! # Moongrain
//!
//! Virtual-actor cluster core: membership, grain directory, placement,
//! transactions and reminders for single-threaded async runtimes.
//!
//! A cluster is a set of [`Silo`]s sharing a membership table. Grains are
//! addressed by [`GrainId`]; the first call to a grain activates it on a
//! silo chosen by placement, and the partitioned grain directory keeps at
//! most one activation of each grain visible at a time.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  runtime: Silo, GrainRef, GrainHandler, activations         │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │  directory   │ transactions │  reminders   │  placement     │
//! │  partitioned │ OCC + 2PC    │ ring-owned   │  strategies    │
//! │  + cache     │ + commit log │ timers       │                │
//! ├──────────────┴──────────────┴──────────────┴────────────────┤
//! │  membership: table, oracle, failure detector                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  transport · ring · time · fault · codec · types            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use moongrain::{ClusterConfig, GrainTypeInfo, GrainTypeRegistry, Silo, SiloConfig};
//!
//! let mut registry = GrainTypeRegistry::new();
//! registry.register(COUNTER, GrainTypeInfo::new("counter", |_| Rc::new(Counter::default())));
//!
//! let cluster = ClusterConfig::builder()
//!     .membership_table(Rc::new(InMemoryMembershipTable::new()))
//!     .transport(Rc::new(LocalTransport::new(time.clone())))
//!     .registry(registry)
//!     .time(time)
//!     .build()?;
//!
//! let silo = Silo::start(&cluster, SiloConfig::builder(address).build()).await?;
//! let total: u64 = silo.grain(COUNTER, "visits").call("increment", &1u64).await?;
//! ```
//!
//! Everything is `!Send`: run silos inside a `tokio::task::LocalSet`.

#![deny(missing_docs)]

pub mod codec;
pub mod directory;
pub mod error;
pub mod fault;
pub mod membership;
pub mod placement;
pub mod reminders;
pub mod ring;
pub mod runtime;
pub mod time;
pub mod transactions;
pub mod transport;
pub mod types;

pub use error::{GrainError, StorageError};
pub use placement::{DefaultPlacementDirector, PlacementDirector, PlacementStrategy};
pub use runtime::{
    CallContext, ClusterConfig, ClusterConfigError, GrainCancellationToken, GrainContext,
    GrainHandler, GrainRef, GrainTypeInfo, GrainTypeRegistry, Silo, SiloConfig, SiloState,
};
pub use time::{TimeProvider, TokioTimeProvider};
pub use transactions::{TransactionOption, TransactionalState};
pub use types::{ActivationId, GrainAddress, GrainId, GrainKey, GrainType, SiloAddress};
