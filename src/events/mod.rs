//! Durable event bus: envelopes, compiled patterns, pub/sub with consumer
//! checkpoints and replay.

pub mod bus;
pub mod envelope;
pub mod pattern;

pub use bus::{
    handler, EventBus, EventHandler, PublishOptions, SubscribeOptions, SubscriptionId,
};
pub use envelope::EventEnvelope;
pub use pattern::EventPattern;
