//! One activation: handler instance, mailbox and turn loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use super::{
    CacheInvalidation, CallContext, GrainCancellationToken, GrainContext, GrainHandler,
    GrainTypeInfo, InvokeKind, InvokeRequest, InvokeResponse, Silo,
};
use crate::error::GrainError;
use crate::transactions::{AbortCause, TransactionInfo};
use crate::types::{ActivationId, GrainAddress, GrainId};

pub(crate) enum WorkItem {
    Invoke {
        request: InvokeRequest,
        reply: oneshot::Sender<InvokeResponse>,
    },
    Deactivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivationState {
    /// Waiting for directory registration and `on_activate`.
    Activating,
    Valid,
    Deactivating,
    /// Gone; late requests get `ActivationNotFound`.
    Invalid,
}

pub(crate) struct Activation {
    context: Rc<GrainContext>,
    handler: Rc<dyn GrainHandler>,
    info: GrainTypeInfo,
    silo: Weak<Silo>,
    mailbox: mpsc::UnboundedSender<WorkItem>,
    state: Cell<ActivationState>,
    running: Cell<usize>,
    processed: Cell<u64>,
    finished: Notify,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("address", self.address())
            .field("state", &self.state.get())
            .field("running", &self.running.get())
            .field("processed", &self.processed.get())
            .finish()
    }
}

impl Activation {
    pub(crate) fn new(
        address: GrainAddress,
        info: GrainTypeInfo,
        silo: Weak<Silo>,
    ) -> (Rc<Self>, mpsc::UnboundedReceiver<WorkItem>) {
        let (mailbox, receiver) = mpsc::unbounded_channel();
        let handler = info.create(&address.grain_id);
        let activation = Rc::new(Self {
            context: Rc::new(GrainContext::new(address, silo.clone())),
            handler,
            info,
            silo,
            mailbox,
            state: Cell::new(ActivationState::Activating),
            running: Cell::new(0),
            processed: Cell::new(0),
            finished: Notify::new(),
            task: RefCell::new(None),
        });
        (activation, receiver)
    }

    pub(crate) fn address(&self) -> &GrainAddress {
        self.context.address()
    }

    pub(crate) fn grain_id(&self) -> &GrainId {
        self.context.grain_id()
    }

    pub(crate) fn id(&self) -> ActivationId {
        self.context.activation_id()
    }

    pub(crate) fn info(&self) -> &GrainTypeInfo {
        &self.info
    }

    pub(crate) fn state(&self) -> ActivationState {
        self.state.get()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state.get() == ActivationState::Valid && self.running.get() == 0
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed.get()
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *self.task.borrow_mut() = Some(task);
    }

    /// Stop the turn loop without running `on_deactivate`.
    pub(crate) fn abort(&self) {
        self.state.set(ActivationState::Invalid);
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
        }
        self.finished.notify_waiters();
    }

    fn not_found(&self) -> InvokeResponse {
        InvokeResponse::error(GrainError::ActivationNotFound {
            grain: self.grain_id().clone(),
            activation: self.id(),
        })
        .with_invalidation(CacheInvalidation {
            grain: self.grain_id().clone(),
            stale: Some(self.id()),
            valid: None,
        })
    }

    fn interleaves(&self, request: &InvokeRequest) -> bool {
        self.info.is_reentrant() || request.always_interleave
    }

    /// Hand `request` to the activation and wait for its response.
    pub(crate) async fn enqueue(self: &Rc<Self>, request: InvokeRequest) -> InvokeResponse {
        match self.state.get() {
            ActivationState::Deactivating | ActivationState::Invalid => return self.not_found(),
            ActivationState::Valid if self.interleaves(&request) => {
                return self.run_turn(request).await
            }
            _ => {}
        }
        let (reply, response) = oneshot::channel();
        if self
            .mailbox
            .send(WorkItem::Invoke { request, reply })
            .is_err()
        {
            return self.not_found();
        }
        response.await.unwrap_or_else(|_| self.not_found())
    }

    /// Ask the turn loop to stop after the current turn.
    pub(crate) fn request_deactivation(&self) {
        let _ = self.mailbox.send(WorkItem::Deactivate);
    }

    /// Deactivate and wait until the activation is gone.
    pub(crate) async fn deactivate(&self) {
        self.request_deactivation();
        loop {
            let finished = self.finished.notified();
            if self.state.get() == ActivationState::Invalid {
                return;
            }
            finished.await;
        }
    }

    /// Turn loop: register, activate, serve, deactivate.
    pub(crate) async fn run(self: Rc<Self>, mut receiver: mpsc::UnboundedReceiver<WorkItem>) {
        if !self.info.placement().is_stateless() {
            let Some(silo) = self.silo.upgrade() else {
                return;
            };
            match silo.register_activation(self.address()).await {
                Ok(winner) if winner.matches(self.address()) => {}
                Ok(winner) => {
                    tracing::debug!(grain = %self.grain_id(), activation = %self.id(), winner = %winner, "lost activation race, forwarding");
                    self.state.set(ActivationState::Invalid);
                    silo.catalog().remove(&self);
                    receiver.close();
                    while let Some(item) = receiver.recv().await {
                        if let WorkItem::Invoke { request, reply } = item {
                            let _ = reply.send(silo.forward(request, &winner).await);
                        }
                    }
                    self.finished.notify_waiters();
                    return;
                }
                Err(error) => {
                    tracing::warn!(grain = %self.grain_id(), error = %error, "activation registration failed");
                    self.state.set(ActivationState::Invalid);
                    silo.catalog().remove(&self);
                    self.fail_pending(&mut receiver, error).await;
                    return;
                }
            }
        }

        if let Err(error) = self.handler.on_activate(&self.context).await {
            tracing::warn!(grain = %self.grain_id(), error = %error, "on_activate failed");
            self.state.set(ActivationState::Deactivating);
            if let Some(silo) = self.silo.upgrade() {
                silo.retire_activation(&self).await;
            }
            self.state.set(ActivationState::Invalid);
            let error = GrainError::ActivationFailed {
                grain: self.grain_id().clone(),
                reason: error.to_string(),
            };
            self.fail_pending(&mut receiver, error).await;
            return;
        }
        self.state.set(ActivationState::Valid);
        tracing::debug!(grain = %self.grain_id(), activation = %self.id(), "grain activated");

        while let Some(item) = receiver.recv().await {
            match item {
                WorkItem::Invoke { request, reply } => {
                    if self.interleaves(&request) {
                        let this = self.clone();
                        tokio::task::spawn_local(async move {
                            let _ = reply.send(this.run_turn(request).await);
                        });
                    } else {
                        let _ = reply.send(self.run_turn(request).await);
                    }
                }
                WorkItem::Deactivate => break,
            }
            if self.context.deactivation_requested() {
                break;
            }
        }

        self.state.set(ActivationState::Deactivating);
        self.handler.on_deactivate(&self.context).await;
        if let Some(silo) = self.silo.upgrade() {
            silo.retire_activation(&self).await;
        }
        self.state.set(ActivationState::Invalid);
        tracing::debug!(grain = %self.grain_id(), activation = %self.id(), processed = self.processed.get(), "grain deactivated");

        receiver.close();
        while let Some(item) = receiver.recv().await {
            if let WorkItem::Invoke { reply, .. } = item {
                let _ = reply.send(self.not_found());
            }
        }
        self.finished.notify_waiters();
    }

    async fn fail_pending(
        &self,
        receiver: &mut mpsc::UnboundedReceiver<WorkItem>,
        error: GrainError,
    ) {
        receiver.close();
        while let Some(item) = receiver.recv().await {
            if let WorkItem::Invoke { reply, .. } = item {
                let _ = reply.send(InvokeResponse::error(error.clone()));
            }
        }
        self.finished.notify_waiters();
    }

    async fn run_turn(self: &Rc<Self>, request: InvokeRequest) -> InvokeResponse {
        if request
            .cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
        {
            return InvokeResponse::error(GrainError::Cancelled);
        }

        self.running.set(self.running.get() + 1);
        let response = match request.kind {
            InvokeKind::Method { name, body } => {
                self.invoke_method(
                    &name,
                    &body,
                    request.transaction,
                    request.create_transaction,
                    request.cancellation,
                )
                .await
            }
            InvokeKind::Reminder { name, status } => InvokeResponse {
                result: self
                    .handler
                    .receive_reminder(&self.context, &name, status)
                    .await
                    .map(|()| Vec::new()),
                transaction: None,
                invalidation: None,
            },
        };
        self.running.set(self.running.get() - 1);
        self.processed.set(self.processed.get() + 1);
        response
    }

    async fn invoke_method(
        &self,
        method: &str,
        body: &[u8],
        transaction: Option<TransactionInfo>,
        create_transaction: bool,
        cancellation: Option<GrainCancellationToken>,
    ) -> InvokeResponse {
        let Some(silo) = self.silo.upgrade() else {
            return InvokeResponse::error(GrainError::SiloStopped {
                silo: self.address().silo.clone(),
            });
        };

        let ambient = if create_transaction {
            Some(silo.coordinator().start())
        } else {
            transaction.map(|info| Rc::new(RefCell::new(info)))
        };
        let call = CallContext::new(self.context.clone(), ambient.clone(), cancellation);
        let mut result = self.handler.dispatch(&call, method, body).await;

        let mut returned = None;
        if let Some(ambient) = ambient {
            if create_transaction {
                let info = ambient.borrow().clone();
                match &result {
                    Ok(_) => {
                        if let Err(error) = silo.coordinator().resolve(&info).await {
                            result = Err(error.into());
                        }
                    }
                    Err(error) => {
                        silo.coordinator()
                            .abort(&info, AbortCause::Application(error.to_string()))
                            .await;
                    }
                }
            } else {
                if let Err(error) = &result {
                    ambient
                        .borrow_mut()
                        .record_abort(AbortCause::Application(error.to_string()));
                }
                returned = Some(ambient.borrow().clone());
            }
        }

        InvokeResponse {
            result,
            transaction: returned,
            invalidation: None,
        }
    }
}
