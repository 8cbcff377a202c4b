//! fleet-operator: control loops for one resource kind.
//!
//! An [`Operator`] pairs a [`Registry`](fleet_registry::Registry) with a
//! [`Reconciler`]. While it holds the kind's leader lease it runs two loops:
//!
//! - a periodic reconcile pass over every object (drift correction);
//! - a watch-driven handler pool, bounded by a semaphore, with panic
//!   isolation per task and an explicit requeue channel.
//!
//! Objects in the `Deleting` phase are routed to the finalizer drain instead,
//! which runs each pending finalizer in order and removes the object once
//! none remain.

pub mod config;
pub mod error;
pub mod operator;
pub mod reconciler;

pub use config::OperatorConfig;
pub use error::{OperatorError, OperatorResult};
pub use operator::Operator;
pub use reconciler::{Reconciler, Requeue};
