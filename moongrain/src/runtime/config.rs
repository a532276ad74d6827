//! Cluster and silo configuration.
//!
//! [`ClusterConfig`] bundles the collaborators every silo of a cluster
//! shares: the durable tables, the transport, the grain type registry and
//! the clock. In tests, all silos reference the same `ClusterConfig` so
//! they see one membership table and one reminder table.
//!
//! [`SiloConfig`] holds what is specific to one silo: its address, its
//! name, and the option structs of each subsystem.
//!
//! # Example
//!
//! ```rust,ignore
//! let time: Rc<dyn TimeProvider> = Rc::new(TokioTimeProvider::new());
//! let cluster = ClusterConfig::builder()
//!     .membership_table(Rc::new(InMemoryMembershipTable::new()))
//!     .transport(Rc::new(LocalTransport::new(time.clone())))
//!     .registry(registry)
//!     .time(time)
//!     .build()?;
//!
//! let silo = Silo::start(&cluster, SiloConfig::builder(address).simulation().build()).await?;
//! ```

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::GrainTypeRegistry;
use crate::directory::{DirectoryOptions, GrainDirectory};
use crate::membership::{MembershipOptions, MembershipTable};
use crate::placement::{DefaultPlacementDirector, PlacementDirector};
use crate::reminders::{InMemoryReminderTable, ReminderOptions, ReminderTable};
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::transactions::{
    InMemoryTransactionLog, InMemoryTransactionalStorage, TransactionLog, TransactionOptions,
    TransactionalStateStorage,
};
use crate::transport::SiloTransport;
use crate::types::SiloAddress;

/// Collaborators shared by every silo of a cluster.
#[derive(Clone)]
pub struct ClusterConfig {
    membership_table: Rc<dyn MembershipTable>,
    reminder_table: Rc<dyn ReminderTable>,
    transaction_log: Rc<dyn TransactionLog>,
    state_storage: Rc<dyn TransactionalStateStorage>,
    transport: Rc<dyn SiloTransport>,
    registry: Rc<GrainTypeRegistry>,
    time: Rc<dyn TimeProvider>,
    placement: Rc<dyn PlacementDirector>,
    directory: Option<Rc<dyn GrainDirectory>>,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("membership_table", &self.membership_table)
            .field("reminder_table", &self.reminder_table)
            .field("transaction_log", &self.transaction_log)
            .field("state_storage", &self.state_storage)
            .field("transport", &self.transport)
            .field("registry", &self.registry)
            .field("placement", &self.placement)
            .field("directory", &self.directory)
            .finish()
    }
}

impl ClusterConfig {
    /// Start building a cluster configuration.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Membership table.
    pub fn membership_table(&self) -> &Rc<dyn MembershipTable> {
        &self.membership_table
    }

    /// Reminder table.
    pub fn reminder_table(&self) -> &Rc<dyn ReminderTable> {
        &self.reminder_table
    }

    /// Transaction commit log.
    pub fn transaction_log(&self) -> &Rc<dyn TransactionLog> {
        &self.transaction_log
    }

    /// Transactional state storage.
    pub fn state_storage(&self) -> &Rc<dyn TransactionalStateStorage> {
        &self.state_storage
    }

    /// Silo-to-silo transport.
    pub fn transport(&self) -> &Rc<dyn SiloTransport> {
        &self.transport
    }

    /// Grain types.
    pub fn registry(&self) -> &Rc<GrainTypeRegistry> {
        &self.registry
    }

    /// Cluster clock.
    pub fn time(&self) -> &Rc<dyn TimeProvider> {
        &self.time
    }

    /// Placement director.
    pub fn placement(&self) -> &Rc<dyn PlacementDirector> {
        &self.placement
    }

    /// Shared grain directory, when the cluster does not partition one
    /// across silos.
    pub fn directory(&self) -> Option<&Rc<dyn GrainDirectory>> {
        self.directory.as_ref()
    }
}

/// Builder for [`ClusterConfig`].
///
/// The membership table, transport and registry are required; every other
/// collaborator defaults to its in-memory implementation.
#[derive(Default)]
pub struct ClusterConfigBuilder {
    membership_table: Option<Rc<dyn MembershipTable>>,
    reminder_table: Option<Rc<dyn ReminderTable>>,
    transaction_log: Option<Rc<dyn TransactionLog>>,
    state_storage: Option<Rc<dyn TransactionalStateStorage>>,
    transport: Option<Rc<dyn SiloTransport>>,
    registry: Option<Rc<GrainTypeRegistry>>,
    time: Option<Rc<dyn TimeProvider>>,
    placement: Option<Rc<dyn PlacementDirector>>,
    directory: Option<Rc<dyn GrainDirectory>>,
}

impl ClusterConfigBuilder {
    /// Set the membership table.
    pub fn membership_table(mut self, table: Rc<dyn MembershipTable>) -> Self {
        self.membership_table = Some(table);
        self
    }

    /// Set the reminder table.
    pub fn reminder_table(mut self, table: Rc<dyn ReminderTable>) -> Self {
        self.reminder_table = Some(table);
        self
    }

    /// Set the transaction log.
    pub fn transaction_log(mut self, log: Rc<dyn TransactionLog>) -> Self {
        self.transaction_log = Some(log);
        self
    }

    /// Set the transactional state storage.
    pub fn state_storage(mut self, storage: Rc<dyn TransactionalStateStorage>) -> Self {
        self.state_storage = Some(storage);
        self
    }

    /// Set the transport.
    pub fn transport(mut self, transport: Rc<dyn SiloTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the grain type registry.
    pub fn registry(mut self, registry: GrainTypeRegistry) -> Self {
        self.registry = Some(Rc::new(registry));
        self
    }

    /// Set the clock.
    pub fn time(mut self, time: Rc<dyn TimeProvider>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the placement director.
    pub fn placement(mut self, placement: Rc<dyn PlacementDirector>) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Use one shared directory instead of partitioning it across silos.
    pub fn directory(mut self, directory: Rc<dyn GrainDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Build the cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership table, transport or registry is
    /// not set.
    pub fn build(self) -> Result<ClusterConfig, ClusterConfigError> {
        let membership_table = self
            .membership_table
            .ok_or(ClusterConfigError::MissingMembershipTable)?;
        let transport = self.transport.ok_or(ClusterConfigError::MissingTransport)?;
        let registry = self.registry.ok_or(ClusterConfigError::MissingRegistry)?;

        Ok(ClusterConfig {
            membership_table,
            reminder_table: self
                .reminder_table
                .unwrap_or_else(|| Rc::new(InMemoryReminderTable::new())),
            transaction_log: self
                .transaction_log
                .unwrap_or_else(|| Rc::new(InMemoryTransactionLog::new())),
            state_storage: self
                .state_storage
                .unwrap_or_else(|| Rc::new(InMemoryTransactionalStorage::new())),
            transport,
            registry,
            time: self.time.unwrap_or_else(|| Rc::new(TokioTimeProvider::new())),
            placement: self
                .placement
                .unwrap_or_else(|| Rc::new(DefaultPlacementDirector::default())),
            directory: self.directory,
        })
    }
}

/// Errors from building a [`ClusterConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ClusterConfigError {
    /// No membership table was provided to the builder.
    #[error("cluster config requires a membership table")]
    MissingMembershipTable,
    /// No transport was provided to the builder.
    #[error("cluster config requires a transport")]
    MissingTransport,
    /// No grain type registry was provided to the builder.
    #[error("cluster config requires a grain type registry")]
    MissingRegistry,
}

/// Grain-call routing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// How long a caller waits for a remote grain call.
    pub response_timeout: Duration,
    /// Forwards (and caller-side re-routes) allowed per call.
    pub max_forward_count: u32,
    /// Pause before re-routing a call whose target moved.
    pub forward_backoff: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            max_forward_count: 2,
            forward_backoff: Duration::from_millis(100),
        }
    }
}

impl RuntimeOptions {
    /// Short timeouts for simulated clusters.
    pub fn for_simulation() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            max_forward_count: 3,
            forward_backoff: Duration::from_millis(50),
        }
    }
}

/// Per-silo settings.
#[derive(Debug, Clone)]
pub struct SiloConfig {
    address: SiloAddress,
    name: String,
    membership: MembershipOptions,
    directory: DirectoryOptions,
    transactions: TransactionOptions,
    reminders: ReminderOptions,
    runtime: RuntimeOptions,
}

impl SiloConfig {
    /// Start building the configuration of the silo at `address`.
    pub fn builder(address: SiloAddress) -> SiloConfigBuilder {
        SiloConfigBuilder {
            name: address.to_string(),
            address,
            membership: MembershipOptions::default(),
            directory: DirectoryOptions::default(),
            transactions: TransactionOptions::default(),
            reminders: ReminderOptions::default(),
            runtime: RuntimeOptions::default(),
        }
    }

    /// Silo address.
    pub fn address(&self) -> &SiloAddress {
        &self.address
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Membership options.
    pub fn membership(&self) -> &MembershipOptions {
        &self.membership
    }

    /// Directory options.
    pub fn directory(&self) -> &DirectoryOptions {
        &self.directory
    }

    /// Transaction options.
    pub fn transactions(&self) -> &TransactionOptions {
        &self.transactions
    }

    /// Reminder options.
    pub fn reminders(&self) -> &ReminderOptions {
        &self.reminders
    }

    /// Routing options.
    pub fn runtime(&self) -> &RuntimeOptions {
        &self.runtime
    }
}

/// Builder for [`SiloConfig`].
#[derive(Debug, Clone)]
pub struct SiloConfigBuilder {
    address: SiloAddress,
    name: String,
    membership: MembershipOptions,
    directory: DirectoryOptions,
    transactions: TransactionOptions,
    reminders: ReminderOptions,
    runtime: RuntimeOptions,
}

impl SiloConfigBuilder {
    /// Set the silo name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use the short timeouts of every subsystem's `for_simulation`.
    pub fn simulation(mut self) -> Self {
        self.membership = MembershipOptions::for_simulation();
        self.directory = DirectoryOptions::for_simulation();
        self.transactions = TransactionOptions::for_simulation();
        self.reminders = ReminderOptions::for_simulation();
        self.runtime = RuntimeOptions::for_simulation();
        self
    }

    /// Set the membership options.
    pub fn membership(mut self, options: MembershipOptions) -> Self {
        self.membership = options;
        self
    }

    /// Set the directory options.
    pub fn directory(mut self, options: DirectoryOptions) -> Self {
        self.directory = options;
        self
    }

    /// Set the transaction options.
    pub fn transactions(mut self, options: TransactionOptions) -> Self {
        self.transactions = options;
        self
    }

    /// Set the reminder options.
    pub fn reminders(mut self, options: ReminderOptions) -> Self {
        self.reminders = options;
        self
    }

    /// Set the routing options.
    pub fn runtime(mut self, options: RuntimeOptions) -> Self {
        self.runtime = options;
        self
    }

    /// Build the silo configuration.
    pub fn build(self) -> SiloConfig {
        SiloConfig {
            address: self.address,
            name: self.name,
            membership: self.membership,
            directory: self.directory,
            transactions: self.transactions,
            reminders: self.reminders,
            runtime: self.runtime,
        }
    }
}
