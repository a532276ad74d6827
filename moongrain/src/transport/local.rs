//! In-process network.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::{MessageHandler, SiloMessage, SiloReply, SiloTransport, TransportError};
use crate::fault::FaultInjector;
use crate::time::{self, TimeProvider};
use crate::types::SiloAddress;

/// Transport delivering messages by direct call, for single-process clusters.
///
/// Supports the two network faults the runtime must survive:
///
/// - [`isolate`](Self::isolate): the silo is cut off from everyone (a crash
///   or a hung process). Requests to or from it time out.
/// - [`partition`](Self::partition): two silos cannot reach each other, but
///   both still talk to the rest of the cluster.
///
/// Built [`with_faults`](Self::with_faults), it also loses replies: the
/// handler runs, but the sender times out. Sites are
/// `"transport.reply/<kind>"` then `"transport.reply"`, with `<kind>` from
/// [`SiloMessage::kind`].
pub struct LocalTransport {
    time: Rc<dyn TimeProvider>,
    faults: Option<Rc<FaultInjector>>,
    handlers: RefCell<HashMap<SiloAddress, Weak<dyn MessageHandler>>>,
    isolated: RefCell<HashSet<SiloAddress>>,
    partitions: RefCell<HashSet<(SiloAddress, SiloAddress)>>,
    delivered: Cell<u64>,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("bound", &self.handlers.borrow().len())
            .field("isolated", &self.isolated.borrow().len())
            .field("delivered", &self.delivered.get())
            .finish()
    }
}

impl LocalTransport {
    /// Create a transport whose timeouts run on `time`.
    pub fn new(time: Rc<dyn TimeProvider>) -> Self {
        Self {
            time,
            faults: None,
            handlers: RefCell::new(HashMap::new()),
            isolated: RefCell::new(HashSet::new()),
            partitions: RefCell::new(HashSet::new()),
            delivered: Cell::new(0),
        }
    }

    /// Transport that drops replies when `faults` says so.
    pub fn with_faults(time: Rc<dyn TimeProvider>, faults: Rc<FaultInjector>) -> Self {
        Self {
            faults: Some(faults),
            ..Self::new(time)
        }
    }

    fn reply_lost(&self, kind: &str) -> bool {
        self.faults.as_ref().is_some_and(|faults| {
            faults.should_fail_any(&format!("transport.reply/{kind}"), "transport.reply")
        })
    }

    /// Cut `silo` off from the network.
    pub fn isolate(&self, silo: &SiloAddress) {
        tracing::info!(silo = %silo, "isolating silo");
        self.isolated.borrow_mut().insert(silo.clone());
    }

    /// Reconnect an isolated silo.
    pub fn reconnect(&self, silo: &SiloAddress) {
        self.isolated.borrow_mut().remove(silo);
    }

    /// Block traffic between `a` and `b` in both directions.
    pub fn partition(&self, a: &SiloAddress, b: &SiloAddress) {
        tracing::info!(a = %a, b = %b, "partitioning silos");
        self.partitions.borrow_mut().insert(ordered(a, b));
    }

    /// Remove a partition between `a` and `b`.
    pub fn heal(&self, a: &SiloAddress, b: &SiloAddress) {
        self.partitions.borrow_mut().remove(&ordered(a, b));
    }

    /// Number of messages delivered to a handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.get()
    }

    fn reachable(&self, from: &SiloAddress, to: &SiloAddress) -> bool {
        let isolated = self.isolated.borrow();
        if isolated.contains(from) || isolated.contains(to) {
            return false;
        }
        !self.partitions.borrow().contains(&ordered(from, to))
    }
}

fn ordered(a: &SiloAddress, b: &SiloAddress) -> (SiloAddress, SiloAddress) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[async_trait::async_trait(?Send)]
impl SiloTransport for LocalTransport {
    fn bind(&self, silo: SiloAddress, handler: Weak<dyn MessageHandler>) {
        self.handlers.borrow_mut().insert(silo, handler);
    }

    fn unbind(&self, silo: &SiloAddress) {
        self.handlers.borrow_mut().remove(silo);
    }

    async fn send(
        &self,
        from: &SiloAddress,
        to: &SiloAddress,
        message: SiloMessage,
        timeout: Duration,
    ) -> Result<SiloReply, TransportError> {
        // Never deliver inline: concurrent senders must interleave.
        tokio::task::yield_now().await;

        if !self.reachable(from, to) {
            self.time.sleep(timeout).await;
            return Err(TransportError::Timeout { silo: to.clone() });
        }

        let handler = self.handlers.borrow().get(to).and_then(Weak::upgrade);
        let Some(handler) = handler else {
            return Err(TransportError::SiloUnavailable { silo: to.clone() });
        };

        self.delivered.set(self.delivered.get() + 1);
        let kind = message.kind();
        let reply = time::timeout(
            self.time.as_ref(),
            timeout,
            handler.handle(from.clone(), message),
        )
        .await
        .map_err(|_| TransportError::Timeout { silo: to.clone() })?;
        if self.reply_lost(kind) {
            tracing::debug!(from = %from, to = %to, kind, "dropping reply");
            self.time.sleep(timeout).await;
            return Err(TransportError::Timeout { silo: to.clone() });
        }
        Ok(reply)
    }
}
