//! # rsocket-core
//!
//! Transport-agnostic RSocket stream engine.
//!
//! This crate provides:
//! - State machines for the four interaction models, on both sides
//! - Payload fragmentation and reassembly
//! - Credit-based flow control and lease gating
//! - A multiplexer that routes frames and local signals to streams

pub mod error;
pub mod fragmenter;
pub mod lease;
pub mod multiplexer;
pub mod reassembler;
pub mod responder;
pub mod signal;
mod stream;
pub mod subscriber;

#[cfg(test)]
mod test_support;

pub use error::RSocketError;
pub use fragmenter::{fragment, is_fragmentable, Fragments, MIN_FRAGMENT_SIZE};
pub use lease::{LeaseDecision, LeaseManager, LeasePolicy};
pub use multiplexer::{Multiplexer, MultiplexerConfig, Role};
pub use reassembler::FragmentsHolder;
pub use responder::{RejectAll, Responder};
pub use signal::{OpenRequest, Requester, Signal, StreamHandle, StreamKey, StreamSignal};
pub use subscriber::{
    ChannelSubscriber, ExtensionReceiver, NoopChannelSubscriber, NoopSubscription, Subscriber,
    Subscription,
};
