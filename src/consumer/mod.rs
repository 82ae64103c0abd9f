//! Persistent subscription consumer: pulls deliveries, runs the processor,
//! settles each delivery, and re-attaches when the subscription drops.

pub mod backoff;
pub mod control;
pub mod processor;

pub use backoff::Backoff;
pub use control::{Consumer, ConsumerConfig};
pub use processor::{ActivityProcessor, DeliveryContext, Processor};
