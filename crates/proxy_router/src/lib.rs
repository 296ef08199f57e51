//! Channel based signal/slot routing.
//!
//! A [`Signal`] is an emitter, a [`Slot`] is a receiver. The [`ProxyRouter`]
//! keeps a table of named channels: every signal bound to a channel is
//! connected to every slot bound to the same channel, so the two ends never
//! hold a reference to each other.
pub mod error;
pub mod router;
pub mod signal;

pub use error::RouterError;
pub use router::ProxyRouter;
pub use signal::{Payload, Signal, Slot, SlotFn};
