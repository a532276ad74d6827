//! Cluster fixture and test grains shared by the scenario modules.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use moongrain::codec::{decode, encode};
use moongrain::directory::{GrainDirectory, InMemoryGrainDirectory};
use moongrain::fault::FaultInjector;
use moongrain::membership::{InMemoryMembershipTable, MembershipOptions};
use moongrain::reminders::{InMemoryReminderTable, ReminderHandle, TickStatus};
use moongrain::transactions::{InMemoryTransactionLog, InMemoryTransactionalStorage};
use moongrain::transport::LocalTransport;
use moongrain::{
    ActivationId, CallContext, ClusterConfig, GrainContext, GrainError, GrainHandler, GrainId,
    GrainType, GrainTypeInfo, GrainTypeRegistry, PlacementStrategy, Silo, SiloAddress, SiloConfig,
    TimeProvider, TokioTimeProvider, TransactionOption, TransactionalState,
};

pub const COUNTER: GrainType = GrainType(0xC0);
pub const ACCOUNT: GrainType = GrainType(0xACC0);
pub const BANK: GrainType = GrainType(0xBA4C);
pub const ALARM: GrainType = GrainType(0xA1A4);
pub const SLEEPER: GrainType = GrainType(0x5100);
pub const REENTRANT_SLEEPER: GrainType = GrainType(0x5101);

/// Run `test` on a current-thread runtime with a paused clock inside a
/// `LocalSet`, so `spawn_local` works.
pub fn run_local_test<F: Future<Output = ()>>(test: F) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("build runtime");
    tokio::task::LocalSet::new().block_on(&runtime, test);
}

pub fn addr(port: u16) -> SiloAddress {
    SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1)
}

pub async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

/// One reminder tick observed by an [`Alarm`] grain.
#[derive(Debug, Clone)]
pub struct Tick {
    pub grain: GrainId,
    pub name: String,
    pub silo: SiloAddress,
    pub at: Duration,
}

/// Shared in-memory backends plus the silos started on them.
pub struct TestCluster {
    pub time: Rc<dyn TimeProvider>,
    pub transport: Rc<LocalTransport>,
    pub table: Rc<InMemoryMembershipTable>,
    pub reminder_table: Rc<InMemoryReminderTable>,
    pub storage: Rc<InMemoryTransactionalStorage>,
    pub log: Rc<InMemoryTransactionLog>,
    pub faults: Rc<FaultInjector>,
    pub ticks: Rc<RefCell<Vec<Tick>>>,
    pub config: ClusterConfig,
    pub membership: MembershipOptions,
    pub silos: Vec<Rc<Silo>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_membership(MembershipOptions::for_simulation())
    }

    pub fn with_membership(membership: MembershipOptions) -> Self {
        Self::build(membership, None)
    }

    /// Cluster whose silos share one non-partitioned directory.
    pub fn with_shared_directory() -> Self {
        Self::build(
            MembershipOptions::for_simulation(),
            Some(Rc::new(InMemoryGrainDirectory::new())),
        )
    }

    fn build(membership: MembershipOptions, directory: Option<Rc<dyn GrainDirectory>>) -> Self {
        let time: Rc<dyn TimeProvider> = Rc::new(TokioTimeProvider::new());
        let faults = Rc::new(FaultInjector::new(7));
        let transport = Rc::new(LocalTransport::new(time.clone()));
        let table = Rc::new(InMemoryMembershipTable::new());
        let reminder_table = Rc::new(InMemoryReminderTable::new());
        let storage = Rc::new(InMemoryTransactionalStorage::with_faults(faults.clone()));
        let log = Rc::new(InMemoryTransactionLog::new());
        let ticks = Rc::new(RefCell::new(Vec::new()));

        let mut builder = ClusterConfig::builder()
            .membership_table(table.clone())
            .reminder_table(reminder_table.clone())
            .state_storage(storage.clone())
            .transaction_log(log.clone())
            .transport(transport.clone())
            .registry(registry(ticks.clone()))
            .time(time.clone());
        if let Some(directory) = directory {
            builder = builder.directory(directory);
        }
        let config = builder.build().expect("cluster config");

        Self {
            time,
            transport,
            table,
            reminder_table,
            storage,
            log,
            faults,
            ticks,
            config,
            membership,
            silos: Vec::new(),
        }
    }

    /// Start a silo on `port` and return it.
    pub async fn start_silo(&mut self, port: u16) -> Rc<Silo> {
        self.start_silo_at(addr(port)).await
    }

    /// Start a silo on `address`, which may be a later generation of a
    /// silo started before.
    pub async fn start_silo_at(&mut self, address: SiloAddress) -> Rc<Silo> {
        let config = SiloConfig::builder(address.clone())
            .name(format!("silo-{}-{}", address.port, address.generation))
            .simulation()
            .membership(self.membership.clone())
            .build();
        let silo = Silo::start(&self.config, config)
            .await
            .expect("silo start");
        self.silos.push(silo.clone());
        silo
    }

    /// Start `count` silos on consecutive ports and let them see each other.
    pub async fn start(&mut self, count: u16) {
        for i in 0..count {
            self.start_silo(11_111 + i).await;
        }
        self.settle().await;
    }

    /// Let membership refreshes propagate.
    pub async fn settle(&self) {
        sleep_secs(3).await;
    }

    pub fn silo(&self, index: usize) -> &Rc<Silo> {
        &self.silos[index]
    }
}

fn registry(ticks: Rc<RefCell<Vec<Tick>>>) -> GrainTypeRegistry {
    let mut registry = GrainTypeRegistry::new();
    registry
        .register(
            COUNTER,
            GrainTypeInfo::new("counter", |_| Rc::new(Counter::default()) as Rc<dyn GrainHandler>),
        )
        .register(
            ACCOUNT,
            GrainTypeInfo::new("account", |_| Rc::new(Account::default()) as Rc<dyn GrainHandler>)
                .with_transaction("deposit", TransactionOption::CreateOrJoin)
                .with_transaction("withdraw", TransactionOption::Join)
                .with_transaction("balance", TransactionOption::CreateOrJoin),
        )
        .register(
            BANK,
            GrainTypeInfo::new("bank", |_| Rc::new(Bank) as Rc<dyn GrainHandler>)
                .with_placement(PlacementStrategy::StatelessWorker { max_local: 2 })
                .with_transaction("transfer", TransactionOption::REQUIRES_NEW)
                .with_transaction("where", TransactionOption::Suppress),
        )
        .register(
            SLEEPER,
            GrainTypeInfo::new("sleeper", |_| Rc::new(Sleeper::default()) as Rc<dyn GrainHandler>)
                .always_interleave("peek"),
        )
        .register(
            REENTRANT_SLEEPER,
            GrainTypeInfo::new("reentrant-sleeper", |_| {
                Rc::new(Sleeper::default()) as Rc<dyn GrainHandler>
            })
            .reentrant(),
        )
        .register(
            ALARM,
            GrainTypeInfo::new("alarm", move |_| {
                Rc::new(Alarm {
                    ticks: ticks.clone(),
                }) as Rc<dyn GrainHandler>
            }),
        );
    registry
}

fn unknown(ctx: &CallContext, method: &str) -> GrainError {
    GrainError::UnknownMethod {
        grain: ctx.grain_id().clone(),
        method: method.to_string(),
    }
}

/// Plain in-memory counter. State is lost on deactivation.
#[derive(Default)]
pub struct Counter {
    value: Cell<u64>,
}

#[async_trait::async_trait(?Send)]
impl GrainHandler for Counter {
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        match method {
            "increment" => {
                let by: u64 = decode(body)?;
                self.value.set(self.value.get() + by);
                encode(&self.value.get())
            }
            "get" => encode(&self.value.get()),
            "whereami" => encode(&(ctx.silo_address().clone(), ctx.activation_id())),
            "deactivate" => {
                ctx.deactivate_on_idle();
                encode(&())
            }
            _ => Err(unknown(ctx, method)),
        }
    }
}

/// Where a counter call landed.
pub type Location = (SiloAddress, ActivationId);

/// Transactional balance.
#[derive(Default)]
pub struct Account {
    balance: RefCell<Option<Rc<TransactionalState<i64>>>>,
}

impl Account {
    fn state(&self, ctx: &CallContext) -> Result<Rc<TransactionalState<i64>>, GrainError> {
        self.balance
            .borrow()
            .clone()
            .ok_or_else(|| GrainError::Application(format!("{} not activated", ctx.grain_id())))
    }
}

#[async_trait::async_trait(?Send)]
impl GrainHandler for Account {
    async fn on_activate(&self, ctx: &GrainContext) -> Result<(), GrainError> {
        let state = ctx.transactional_state::<i64>("balance").await?;
        *self.balance.borrow_mut() = Some(state);
        Ok(())
    }

    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        let state = self.state(ctx)?;
        let tx = ctx.require_transaction()?;
        match method {
            "deposit" => {
                let amount: i64 = decode(body)?;
                state.perform_update(tx, |balance| *balance += amount)?;
                encode(&())
            }
            "withdraw" => {
                let amount: i64 = decode(body)?;
                let ok = state.perform_update(tx, |balance| {
                    if *balance >= amount {
                        *balance -= amount;
                        true
                    } else {
                        false
                    }
                })?;
                if !ok {
                    return Err(GrainError::Application("insufficient funds".into()));
                }
                encode(&())
            }
            "balance" => encode(&state.perform_read(tx, |balance| *balance)?),
            _ => Err(unknown(ctx, method)),
        }
    }
}

/// Stateless transfer front-end.
pub struct Bank;

#[async_trait::async_trait(?Send)]
impl GrainHandler for Bank {
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        match method {
            "transfer" => {
                let (from, to, amount): (String, String, i64) = decode(body)?;
                // Credit first so a failed debit has a write to roll back.
                ctx.grain(ACCOUNT, to).call::<_, ()>("deposit", &amount).await?;
                ctx.grain(ACCOUNT, from).call::<_, ()>("withdraw", &amount).await?;
                encode(&())
            }
            "where" => encode(ctx.silo_address()),
            _ => Err(unknown(ctx, method)),
        }
    }
}

/// Holds its turn for a while and counts how many turns overlap.
#[derive(Default)]
pub struct Sleeper {
    running: Cell<usize>,
    max_running: Cell<usize>,
    holds: Cell<u64>,
}

#[async_trait::async_trait(?Send)]
impl GrainHandler for Sleeper {
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        match method {
            "hold" => {
                let ms: u64 = decode(body)?;
                self.holds.set(self.holds.get() + 1);
                self.running.set(self.running.get() + 1);
                self.max_running.set(self.max_running.get().max(self.running.get()));
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.running.set(self.running.get() - 1);
                encode(&())
            }
            "peek" => encode(&self.running.get()),
            "max_running" => encode(&self.max_running.get()),
            "holds" => encode(&self.holds.get()),
            "call_self" => {
                let id = ctx.grain_id().clone();
                let holds: u64 = ctx.grain(id.grain_type, id.key).call("holds", &()).await?;
                encode(&holds)
            }
            _ => Err(unknown(ctx, method)),
        }
    }
}

/// Registers reminders on request and records every tick.
pub struct Alarm {
    ticks: Rc<RefCell<Vec<Tick>>>,
}

#[async_trait::async_trait(?Send)]
impl GrainHandler for Alarm {
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        match method {
            "arm" => {
                let (name, due_ms, period_ms): (String, u64, u64) = decode(body)?;
                let handle = ctx
                    .register_or_update_reminder(
                        &name,
                        Duration::from_millis(due_ms),
                        Duration::from_millis(period_ms),
                    )
                    .await?;
                encode(&handle)
            }
            "disarm" => {
                let handle: ReminderHandle = decode(body)?;
                ctx.unregister_reminder(&handle).await?;
                encode(&())
            }
            "list" => {
                let names: Vec<String> = ctx
                    .get_reminders()
                    .await?
                    .into_iter()
                    .map(|entry| entry.name)
                    .collect();
                encode(&names)
            }
            _ => Err(unknown(ctx, method)),
        }
    }

    async fn receive_reminder(
        &self,
        ctx: &GrainContext,
        name: &str,
        status: TickStatus,
    ) -> Result<(), GrainError> {
        self.ticks.borrow_mut().push(Tick {
            grain: ctx.grain_id().clone(),
            name: name.to_string(),
            silo: ctx.silo_address().clone(),
            at: status.current_tick_time,
        });
        Ok(())
    }
}
