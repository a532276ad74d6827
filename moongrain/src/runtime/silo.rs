//! Silo: one member of the cluster.
//!
//! # Call path
//!
//! The calling silo resolves the target grain in order: stateless workers
//! run locally; otherwise the lookup cache, then the directory, then
//! placement. The request goes to the chosen silo with the expected
//! activation id (or none when placement picked the silo). The receiving
//! silo either hands it to that activation or, for a new placement,
//! creates one, which registers with the directory before it runs. A
//! stale target comes back as `ActivationNotFound` with an invalidation
//! hint, and the caller re-resolves within its forward budget.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::activation::Activation;
use super::catalog::Catalog;
use super::{
    CacheInvalidation, ClusterConfig, DetailedGrainStatistic, GrainCancellationToken, GrainRef,
    GrainTypeInfo, InvokeKind, InvokeRequest, InvokeResponse, SiloConfig,
};
use crate::directory::{DirectoryCache, DistributedGrainDirectory, GrainDirectory};
use crate::error::GrainError;
use crate::membership::{FailureDetector, MembershipOracle, MembershipSnapshot, SiloStatus};
use crate::placement::PlacementStrategy;
use crate::reminders::{ReminderDelivery, ReminderService, TickStatus};
use crate::transactions::{
    AbortCause, ResourceRegistry, TransactionContext, TransactionCoordinator, TransactionLog,
    TransactionScope, TransactionalStateStorage,
};
use crate::time;
use crate::transport::{MessageHandler, SiloMessage, SiloReply, TransportError};
use crate::types::{ActivationId, GrainAddress, GrainId, GrainKey, GrainType, SiloAddress};

/// Lifecycle of a [`Silo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiloState {
    /// Joining the cluster.
    Starting,
    /// Serving calls.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Stopped or killed.
    Stopped,
}

/// One silo: hosts activations and a share of the directory and reminders.
pub struct Silo {
    local: SiloAddress,
    config: SiloConfig,
    cluster: ClusterConfig,
    oracle: Rc<MembershipOracle>,
    detector: Rc<FailureDetector>,
    directory: Rc<dyn GrainDirectory>,
    distributed: Option<Rc<DistributedGrainDirectory>>,
    cache: DirectoryCache,
    catalog: Catalog,
    coordinator: TransactionCoordinator,
    reminders: Rc<ReminderService>,
    view: RefCell<Rc<MembershipSnapshot>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    state: Cell<SiloState>,
    this: Weak<Silo>,
}

impl fmt::Debug for Silo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Silo")
            .field("local", &self.local)
            .field("state", &self.state.get())
            .field("activations", &self.catalog.len())
            .field("view", &self.view.borrow().version)
            .finish()
    }
}

impl Silo {
    /// Start a silo: bind the transport, join the membership table, and
    /// spawn the background loops (heartbeat, table refresh, failure
    /// detection, reminder refresh, view changes).
    ///
    /// Must run inside a `tokio::task::LocalSet`.
    pub async fn start(
        cluster: &ClusterConfig,
        config: SiloConfig,
    ) -> Result<Rc<Silo>, GrainError> {
        let local = config.address().clone();
        let time = cluster.time().clone();
        let transport = cluster.transport().clone();

        let oracle = Rc::new(MembershipOracle::new(
            local.clone(),
            config.name(),
            cluster.membership_table().clone(),
            time.clone(),
            config.membership().clone(),
        ));
        let detector = Rc::new(FailureDetector::new(
            oracle.clone(),
            transport.clone(),
            time.clone(),
        ));
        let (directory, distributed) = match cluster.directory() {
            Some(shared) => (shared.clone(), None),
            None => {
                let distributed = Rc::new(DistributedGrainDirectory::new(
                    oracle.clone(),
                    transport.clone(),
                    time.clone(),
                    config.directory().clone(),
                ));
                let directory: Rc<dyn GrainDirectory> = distributed.clone();
                (directory, Some(distributed))
            }
        };
        let coordinator = TransactionCoordinator::new(
            local.clone(),
            cluster.transaction_log().clone(),
            Rc::new(ResourceRegistry::new()),
            transport.clone(),
            time.clone(),
            config.transactions().clone(),
        );

        let silo = Rc::new_cyclic(|this: &Weak<Silo>| {
            let delivery: Weak<dyn ReminderDelivery> = this.clone();
            let reminders = ReminderService::new(
                oracle.clone(),
                cluster.reminder_table().clone(),
                transport.clone(),
                time.clone(),
                config.reminders().clone(),
                delivery,
            );
            Silo {
                local: local.clone(),
                config,
                cluster: cluster.clone(),
                oracle,
                detector,
                directory,
                distributed,
                cache: DirectoryCache::new(),
                catalog: Catalog::new(),
                coordinator,
                reminders,
                view: RefCell::new(Rc::new(MembershipSnapshot::default())),
                tasks: RefCell::new(Vec::new()),
                state: Cell::new(SiloState::Starting),
                this: this.clone(),
            }
        });

        let handler: Weak<dyn MessageHandler> = silo.this.clone();
        transport.bind(local.clone(), handler);
        let membership = silo.oracle.subscribe();

        let joined = async {
            silo.oracle.join().await?;
            silo.oracle.refresh().await
        }
        .await;
        let view = match joined {
            Ok(view) => view,
            Err(error) => {
                tracing::error!(silo = %local, error = %error, "failed to join cluster");
                transport.unbind(&local);
                silo.state.set(SiloState::Stopped);
                return Err(error.into());
            }
        };
        silo.apply_view(view).await;

        {
            let mut tasks = silo.tasks.borrow_mut();
            tasks.push(tokio::task::spawn_local(silo.oracle.clone().heartbeat_loop()));
            tasks.push(tokio::task::spawn_local(silo.oracle.clone().refresh_loop()));
            tasks.push(tokio::task::spawn_local(silo.detector.clone().run()));
            tasks.push(tokio::task::spawn_local(silo.reminders.clone().refresh_loop()));
            tasks.push(tokio::task::spawn_local(watch_membership(
                silo.this.clone(),
                membership,
            )));
        }

        silo.state.set(SiloState::Running);
        tracing::info!(silo = %local, name = %silo.config.name(), "silo started");
        Ok(silo)
    }

    /// This silo's address.
    pub fn address(&self) -> &SiloAddress {
        &self.local
    }

    /// Lifecycle state.
    pub fn state(&self) -> SiloState {
        self.state.get()
    }

    /// Membership oracle.
    pub fn oracle(&self) -> &Rc<MembershipOracle> {
        &self.oracle
    }

    /// Failure detector.
    pub fn detector(&self) -> &Rc<FailureDetector> {
        &self.detector
    }

    /// The grain directory as seen from this silo.
    pub fn directory(&self) -> &Rc<dyn GrainDirectory> {
        &self.directory
    }

    /// This silo's directory partition, when the directory is partitioned.
    pub fn directory_partition(&self) -> Option<&Rc<DistributedGrainDirectory>> {
        self.distributed.as_ref()
    }

    /// Reminder service.
    pub fn reminders(&self) -> &Rc<ReminderService> {
        &self.reminders
    }

    /// Last membership view applied.
    pub fn view(&self) -> Rc<MembershipSnapshot> {
        self.view.borrow().clone()
    }

    /// Cluster clock.
    pub fn now(&self) -> Duration {
        self.cluster.time().now()
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub(crate) fn resources(&self) -> &Rc<ResourceRegistry> {
        self.coordinator.resources()
    }

    pub(crate) fn state_storage(&self) -> &Rc<dyn TransactionalStateStorage> {
        self.cluster.state_storage()
    }

    pub(crate) fn transaction_log(&self) -> &Rc<dyn TransactionLog> {
        self.cluster.transaction_log()
    }

    /// Reference to a grain, called from outside any grain.
    pub fn grain(&self, grain_type: GrainType, key: impl Into<GrainKey>) -> GrainRef {
        GrainRef::new(
            GrainId::new(grain_type, key),
            self.this.clone(),
            self.local.clone(),
        )
    }

    fn accepting_calls(&self) -> bool {
        matches!(self.state.get(), SiloState::Starting | SiloState::Running)
    }

    fn stopped_error(&self) -> GrainError {
        GrainError::SiloStopped {
            silo: self.local.clone(),
        }
    }

    // ---- Caller side ----

    pub(crate) async fn call_grain(
        &self,
        grain: &GrainId,
        method: &str,
        body: Vec<u8>,
        ambient: Option<&TransactionContext>,
        cancellation: Option<GrainCancellationToken>,
    ) -> Result<Vec<u8>, GrainError> {
        if !self.accepting_calls() {
            return Err(self.stopped_error());
        }
        let info = self.cluster.registry().get(grain.grain_type)?;
        let scope = info.transaction_option(method).resolve(ambient)?;
        let (transaction, create_transaction) = match &scope {
            TransactionScope::None => (None, false),
            TransactionScope::Ambient(ctx) => (Some(ctx.borrow().fork()), false),
            TransactionScope::New => (None, true),
        };

        let request = InvokeRequest {
            target: grain.clone(),
            target_activation: None,
            caller: self.local.clone(),
            kind: InvokeKind::Method {
                name: method.to_string(),
                body,
            },
            transaction,
            create_transaction,
            always_interleave: info.is_interleaved(method),
            forward_count: 0,
            cancellation,
        };
        let outcome = self.route(request, info).await;

        if let TransactionScope::Ambient(ctx) = &scope {
            let returned = outcome.as_ref().ok().and_then(|r| r.transaction.as_ref());
            match returned {
                Some(returned) => ctx.borrow_mut().join(returned),
                None => ctx.borrow_mut().record_abort(AbortCause::Application(format!(
                    "call to {grain}.{method} returned no transaction state"
                ))),
            }
        }
        outcome?.result
    }

    async fn route(
        &self,
        mut request: InvokeRequest,
        info: &GrainTypeInfo,
    ) -> Result<InvokeResponse, GrainError> {
        let options = self.config.runtime();
        let mut attempts = 0;
        loop {
            let (target, activation) = self.locate(&request.target, info).await?;
            request.target_activation = activation;

            let response = if target == self.local {
                self.invoke_local(&request.target, self.handle_invoke(request.clone()))
                    .await
            } else {
                match self.send_invoke(&target, request.clone()).await {
                    Ok(response) => response,
                    Err(error) => InvokeResponse::error(error),
                }
            };
            if let Some(hint) = &response.invalidation {
                self.apply_invalidation(hint);
            }

            match &response.result {
                Err(error) if retryable(error) => {
                    self.cache.invalidate(&request.target);
                    attempts += 1;
                    if attempts > options.max_forward_count {
                        tracing::warn!(silo = %self.local, grain = %request.target, error = %error, attempts, "giving up on grain call");
                        return Ok(response);
                    }
                    tracing::debug!(silo = %self.local, grain = %request.target, target = %target, error = %error, "re-routing grain call");
                    self.cluster.time().sleep(options.forward_backoff).await;
                }
                Err(GrainError::Transport(_)) => {
                    self.cache.invalidate(&request.target);
                    return Ok(response);
                }
                _ => return Ok(response),
            }
        }
    }

    /// Where to send a call to `grain`, and which activation to expect.
    async fn locate(
        &self,
        grain: &GrainId,
        info: &GrainTypeInfo,
    ) -> Result<(SiloAddress, Option<ActivationId>), GrainError> {
        if info.placement().is_stateless() {
            return Ok((self.local.clone(), None));
        }
        let view = self.view();

        if let Some(cached) = self.cache.get(grain) {
            if view.is_active(&cached.address.silo) {
                return Ok((cached.address.silo, Some(cached.address.activation_id)));
            }
            self.cache.invalidate(grain);
        }

        if let Some(address) = self.directory.lookup(grain).await? {
            if view.is_active(&address.silo) {
                let located = (address.silo.clone(), Some(address.activation_id));
                self.cache.put(address, view.version);
                return Ok(located);
            }
        }

        let candidates = view.active_silos();
        let silo = self
            .cluster
            .placement()
            .choose_silo(grain, info.placement(), &self.local, &candidates)?;
        Ok((silo, None))
    }

    async fn send_invoke(
        &self,
        target: &SiloAddress,
        request: InvokeRequest,
    ) -> Result<InvokeResponse, GrainError> {
        let reply = self
            .cluster
            .transport()
            .send(
                &self.local,
                target,
                SiloMessage::Invoke(request),
                self.config.runtime().response_timeout,
            )
            .await?;
        match reply {
            SiloReply::Invoke(response) => Ok(response),
            SiloReply::Rejected => Err(GrainError::SiloStopped {
                silo: target.clone(),
            }),
            _ => Err(TransportError::UnexpectedReply {
                silo: target.clone(),
            }
            .into()),
        }
    }

    /// Await a call served by this silo under the deadline the transport
    /// gives a remote one.
    async fn invoke_local<F>(&self, grain: &GrainId, invoke: F) -> InvokeResponse
    where
        F: Future<Output = InvokeResponse>,
    {
        let deadline = self.config.runtime().response_timeout;
        match time::timeout(self.cluster.time().as_ref(), deadline, invoke).await {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(silo = %self.local, grain = %grain, ?deadline, "local grain call timed out");
                InvokeResponse::error(
                    TransportError::Timeout {
                        silo: self.local.clone(),
                    }
                    .into(),
                )
            }
        }
    }

    fn apply_invalidation(&self, hint: &CacheInvalidation) {
        match &hint.valid {
            Some(valid) => self.cache.put(valid.clone(), self.view.borrow().version),
            None => self.cache.invalidate(&hint.grain),
        }
    }

    // ---- Hosting side ----

    /// Run `request` on a local activation, creating one if needed.
    pub(crate) async fn handle_invoke(&self, request: InvokeRequest) -> InvokeResponse {
        if !self.accepting_calls() {
            return InvokeResponse::error(self.stopped_error());
        }
        let info = match self.cluster.registry().get(request.target.grain_type) {
            Ok(info) => info.clone(),
            Err(error) => return InvokeResponse::error(error),
        };

        if let PlacementStrategy::StatelessWorker { max_local } = info.placement() {
            let activation = self.catalog.worker(&request.target, *max_local, || {
                self.create_activation(&request.target, &info)
            });
            return activation.enqueue(request).await;
        }

        match (request.target_activation, self.catalog.get(&request.target)) {
            (Some(expected), Some(activation)) if activation.id() == expected => {
                activation.enqueue(request).await
            }
            (Some(expected), current) => {
                if current.is_none() {
                    let stale = GrainAddress::new(
                        request.target.clone(),
                        self.local.clone(),
                        expected,
                        info.placement().clone(),
                    );
                    if let Err(error) = self.directory.unregister(&stale).await {
                        tracing::debug!(silo = %self.local, stale = %stale, error = %error, "failed to drop stale record");
                    }
                }
                InvokeResponse::error(GrainError::ActivationNotFound {
                    grain: request.target.clone(),
                    activation: expected,
                })
                .with_invalidation(CacheInvalidation {
                    grain: request.target.clone(),
                    stale: Some(expected),
                    valid: current.map(|a| a.address().clone()),
                })
            }
            (None, Some(activation)) => activation.enqueue(request).await,
            (None, None) => {
                let activation = self.create_activation(&request.target, &info);
                self.catalog.insert(activation.clone());
                activation.enqueue(request).await
            }
        }
    }

    fn create_activation(&self, grain: &GrainId, info: &GrainTypeInfo) -> Rc<Activation> {
        let address = GrainAddress::new(
            grain.clone(),
            self.local.clone(),
            ActivationId::random(),
            info.placement().clone(),
        );
        let (activation, receiver) = Activation::new(address, info.clone(), self.this.clone());
        let task = tokio::task::spawn_local(activation.clone().run(receiver));
        activation.set_task(task);
        activation
    }

    pub(crate) async fn register_activation(
        &self,
        address: &GrainAddress,
    ) -> Result<GrainAddress, GrainError> {
        Ok(self.directory.register(address.clone()).await?)
    }

    /// Send `request`, queued on a losing activation, to the winner.
    pub(crate) async fn forward(
        &self,
        mut request: InvokeRequest,
        winner: &GrainAddress,
    ) -> InvokeResponse {
        let max = self.config.runtime().max_forward_count;
        request.forward_count += 1;
        if request.forward_count > max {
            return InvokeResponse::error(GrainError::TooManyForwards {
                grain: request.target.clone(),
                max,
            });
        }
        request.target_activation = Some(winner.activation_id);
        let grain = request.target.clone();

        let response = if winner.silo == self.local {
            match self.catalog.get(&grain) {
                Some(activation) if activation.id() == winner.activation_id => {
                    self.invoke_local(&grain, activation.enqueue(request)).await
                }
                _ => InvokeResponse::error(GrainError::ActivationNotFound {
                    grain: grain.clone(),
                    activation: winner.activation_id,
                }),
            }
        } else {
            match self.send_invoke(&winner.silo, request).await {
                Ok(response) => response,
                Err(error) => InvokeResponse::error(error),
            }
        };
        if response.invalidation.is_some() {
            return response;
        }
        response.with_invalidation(CacheInvalidation {
            grain,
            stale: None,
            valid: Some(winner.clone()),
        })
    }

    /// Unregister and forget an activation that finished deactivating.
    pub(crate) async fn retire_activation(&self, activation: &Activation) {
        let address = activation.address();
        if !address.placement.is_stateless() {
            if let Err(error) = self.directory.unregister(address).await {
                tracing::warn!(silo = %self.local, grain = %address.grain_id, error = %error, "failed to unregister activation");
            }
            self.coordinator.resources().unregister_grain(&address.grain_id);
        }
        self.catalog.remove(activation);
        self.cache.invalidate_if_matches(address);
    }

    fn deactivate_duplicate(&self, address: &GrainAddress) {
        if let Some(activation) = self.catalog.get_exact(&address.grain_id, address.activation_id) {
            tracing::info!(silo = %self.local, grain = %address.grain_id, activation = %address.activation_id, "deactivating duplicate activation");
            activation.request_deactivation();
        }
    }

    // ---- Membership ----

    async fn apply_view(&self, view: Rc<MembershipSnapshot>) {
        let previous = self.view();
        if view.version <= previous.version {
            return;
        }
        *self.view.borrow_mut() = view.clone();
        let removed = view.removed_since(&previous);
        if !removed.is_empty() {
            tracing::info!(silo = %self.local, version = ?view.version, removed = ?removed, "silos left the view");
            self.cache.remove_silos(&removed);
        }

        match &self.distributed {
            Some(distributed) => distributed.on_view_change(view.clone()).await,
            None if !removed.is_empty() => {
                if let Err(error) = self.directory.unregister_silos(&removed).await {
                    tracing::warn!(silo = %self.local, error = %error, "failed to purge departed silos");
                }
            }
            None => {}
        }
        self.reminders.on_view_change(view.clone()).await;

        if self.distributed.is_some() && !removed.is_empty() {
            self.reregister_orphans(&previous, &removed).await;
        }
    }

    /// Re-register local activations whose directory partition died with
    /// a removed silo. An activation that finds another one already
    /// registered is deactivated.
    async fn reregister_orphans(&self, previous: &MembershipSnapshot, removed: &[SiloAddress]) {
        for activation in self.catalog.all() {
            let address = activation.address();
            if address.placement.is_stateless() {
                continue;
            }
            let orphaned = previous
                .ring()
                .owner_of(&address.grain_id)
                .is_some_and(|owner| removed.contains(owner));
            if !orphaned {
                continue;
            }
            match self.directory.register(address.clone()).await {
                Ok(winner) if winner.matches(address) => {
                    tracing::debug!(silo = %self.local, grain = %address.grain_id, "re-registered orphaned activation");
                }
                Ok(winner) => {
                    tracing::info!(silo = %self.local, grain = %address.grain_id, winner = %winner, "orphaned activation lost to another");
                    activation.request_deactivation();
                }
                Err(error) => {
                    tracing::warn!(silo = %self.local, grain = %address.grain_id, error = %error, "failed to re-register orphaned activation");
                }
            }
        }
    }

    // ---- Lifecycle ----

    /// Graceful shutdown: deactivate every activation, hand the directory
    /// partition to the survivors, stop reminders, and leave the table.
    pub async fn stop(&self) -> Result<(), GrainError> {
        if self.state.get() != SiloState::Running {
            return Ok(());
        }
        self.state.set(SiloState::Stopping);
        tracing::info!(silo = %self.local, activations = self.catalog.len(), "silo stopping");

        for activation in self.catalog.all() {
            activation.deactivate().await;
        }
        if let Some(distributed) = &self.distributed {
            distributed.hand_off_all().await;
        }
        self.reminders.stop();
        let left = self.oracle.leave(true).await;
        self.shutdown();
        tracing::info!(silo = %self.local, "silo stopped");
        Ok(left?)
    }

    /// Crash: stop every task without telling anyone. The rest of the
    /// cluster finds out through failure detection.
    pub fn kill(&self) {
        if self.state.get() == SiloState::Stopped {
            return;
        }
        tracing::warn!(silo = %self.local, activations = self.catalog.len(), "silo killed");
        self.reminders.stop();
        for activation in self.catalog.drain() {
            activation.abort();
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        self.state.set(SiloState::Stopped);
        self.cluster.transport().unbind(&self.local);
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
    }

    // ---- Management ----

    /// Silos of the current view with their status.
    pub fn get_hosts(&self, only_active: bool) -> BTreeMap<SiloAddress, SiloStatus> {
        self.view()
            .entries()
            .filter(|entry| !only_active || entry.status.is_active())
            .map(|entry| (entry.silo.clone(), entry.status))
            .collect()
    }

    /// Activations across every Active silo, optionally filtered by type.
    /// Unreachable silos are skipped.
    pub async fn get_detailed_grain_statistics(
        &self,
        types: Option<&[GrainType]>,
    ) -> Vec<DetailedGrainStatistic> {
        let mut stats = Vec::new();
        for silo in self.view().active_silos() {
            if silo == self.local {
                stats.extend(self.catalog.statistics(&self.local, types));
                continue;
            }
            let message = SiloMessage::GrainStatistics {
                types: types.map(<[GrainType]>::to_vec),
            };
            match self
                .cluster
                .transport()
                .send(&self.local, &silo, message, self.config.runtime().response_timeout)
                .await
            {
                Ok(SiloReply::GrainStatistics(remote)) => stats.extend(remote),
                Ok(_) => {
                    tracing::warn!(silo = %self.local, target = %silo, "unexpected statistics reply")
                }
                Err(error) => {
                    tracing::warn!(silo = %self.local, target = %silo, error = %error, "statistics unavailable")
                }
            }
        }
        stats
    }

    /// Total activations across every reachable Active silo.
    pub async fn get_total_activation_count(&self) -> usize {
        self.get_detailed_grain_statistics(None).await.len()
    }

    /// Activations hosted by this silo.
    pub fn local_activation_count(&self) -> usize {
        self.catalog.len()
    }
}

/// Calls that certainly never ran and may be re-routed.
fn retryable(error: &GrainError) -> bool {
    matches!(
        error,
        GrainError::ActivationNotFound { .. }
            | GrainError::SiloStopped { .. }
            | GrainError::Transport(TransportError::SiloUnavailable { .. })
    )
}

async fn watch_membership(
    silo: Weak<Silo>,
    mut membership: watch::Receiver<Rc<MembershipSnapshot>>,
) {
    while membership.changed().await.is_ok() {
        let view = membership.borrow_and_update().clone();
        let Some(silo) = silo.upgrade() else {
            break;
        };
        if silo.oracle.is_terminated() {
            tracing::error!(silo = %silo.local, "declared dead by the cluster, shutting down");
            silo.kill();
            break;
        }
        silo.apply_view(view).await;
    }
}

#[async_trait::async_trait(?Send)]
impl MessageHandler for Silo {
    async fn handle(&self, from: SiloAddress, message: SiloMessage) -> SiloReply {
        if self.state.get() == SiloState::Stopped {
            return SiloReply::Rejected;
        }
        match message {
            SiloMessage::Ping { .. } => SiloReply::Pong,
            SiloMessage::Directory(request) => match &self.distributed {
                Some(distributed) => SiloReply::Directory(distributed.handle(&from, request).await),
                None => SiloReply::Rejected,
            },
            SiloMessage::Invoke(request) => SiloReply::Invoke(self.handle_invoke(request).await),
            SiloMessage::Resource(request) => {
                SiloReply::Resource(self.coordinator.resources().handle(request).await)
            }
            SiloMessage::ReminderChanged { grain, name } => {
                self.reminders.on_reminder_changed(&grain, &name).await;
                SiloReply::Ack
            }
            SiloMessage::DuplicateActivation(address) => {
                self.deactivate_duplicate(&address);
                SiloReply::Ack
            }
            SiloMessage::GrainStatistics { types } => {
                SiloReply::GrainStatistics(self.catalog.statistics(&self.local, types.as_deref()))
            }
        }
    }
}

#[async_trait::async_trait(?Send)]
impl ReminderDelivery for Silo {
    async fn deliver_reminder(
        &self,
        grain: &GrainId,
        name: &str,
        status: TickStatus,
    ) -> Result<(), GrainError> {
        if !self.accepting_calls() {
            return Err(self.stopped_error());
        }
        let info = self.cluster.registry().get(grain.grain_type)?;
        let request = InvokeRequest {
            target: grain.clone(),
            target_activation: None,
            caller: self.local.clone(),
            kind: InvokeKind::Reminder {
                name: name.to_string(),
                status,
            },
            transaction: None,
            create_transaction: false,
            always_interleave: false,
            forward_count: 0,
            cancellation: None,
        };
        self.route(request, info).await?.result.map(|_| ())
    }
}
