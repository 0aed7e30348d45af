//! The seam between a consensus engine and whatever moves its messages.
//!
//! Implementations:
//! - [`LocalDispatcher`](crate::simulation::LocalDispatcher): in-memory FIFO
//!   queues driven step by step by a [`LocalNetwork`](crate::simulation::LocalNetwork).
//! - [`TcpDispatcher`](crate::transport::TcpDispatcher): JSON lines over TCP.
//!
//! Both keep their clocks in a [`LogicalClock`](crate::clock::LogicalClock),
//! so admission behaves identically whichever transport is plugged in.

use crate::carry::Carries;
use crate::clock::{Admission, StepId};
use crate::message::Message;

pub trait Dispatcher {
    /// Stamps `carries` with the next stamp and the current step and sends them
    /// to every other node. Does nothing once paused. Must not block.
    fn broadcast(&mut self, carries: Carries);

    /// Moves to the next round. Called by the engine after each commit.
    fn inc_step(&mut self);

    /// Stops the node: inbound traffic is dropped and nothing is sent anymore.
    fn pause(&mut self);

    /// Admission check for an inbound message.
    fn on_receive(&mut self, message: &Message) -> Admission;

    fn is_running(&self) -> bool;

    fn step(&self) -> StepId;
}
