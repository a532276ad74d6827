//! Silo-to-silo messaging.
//!
//! Every cross-silo interaction (failure-detector pings, directory requests,
//! grain invocations, transaction prepare/confirm, management queries) is a
//! [`SiloMessage`] answered by a [`SiloReply`]. The runtime only sees the
//! [`SiloTransport`] trait; [`LocalTransport`] is the in-process network
//! used to run a whole cluster inside one test, with crash and partition
//! injection.
//!
//! # Design
//!
//! - Request/response only. A silo registers a [`MessageHandler`] under its
//!   address with [`SiloTransport::bind`]; the transport holds it weakly so
//!   a dropped silo simply becomes unreachable.
//! - Every send carries its own timeout. An unreachable silo does not fail
//!   fast: the call waits out the timeout, which is what the failure
//!   detector counts as a missed probe.

mod local;
mod message;

use std::fmt;
use std::rc::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use local::LocalTransport;
pub use message::{SiloMessage, SiloReply};

use crate::types::SiloAddress;

/// Errors from sending a message to another silo.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransportError {
    /// Nothing is listening at the target address.
    #[error("silo {silo} unavailable")]
    SiloUnavailable {
        /// The target silo.
        silo: SiloAddress,
    },

    /// No reply within the timeout.
    #[error("request to {silo} timed out")]
    Timeout {
        /// The target silo.
        silo: SiloAddress,
    },

    /// The reply did not match the request kind.
    #[error("unexpected reply from {silo}")]
    UnexpectedReply {
        /// The target silo.
        silo: SiloAddress,
    },
}

/// Server side of the transport: one per silo.
#[async_trait::async_trait(?Send)]
pub trait MessageHandler {
    /// Handle one request from `from`.
    async fn handle(&self, from: SiloAddress, message: SiloMessage) -> SiloReply;
}

/// Client side of the transport, shared by all silos of a cluster.
#[async_trait::async_trait(?Send)]
pub trait SiloTransport: fmt::Debug {
    /// Start accepting messages for `silo`.
    fn bind(&self, silo: SiloAddress, handler: Weak<dyn MessageHandler>);

    /// Stop accepting messages for `silo`.
    fn unbind(&self, silo: &SiloAddress);

    /// Send `message` to `to` and wait up to `timeout` for the reply.
    async fn send(
        &self,
        from: &SiloAddress,
        to: &SiloAddress,
        message: SiloMessage,
        timeout: Duration,
    ) -> Result<SiloReply, TransportError>;
}
