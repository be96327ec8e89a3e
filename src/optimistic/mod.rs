//! Optimistic mutations: speculative cache writes reconciled with the server.

mod events;
mod manager;
mod retry;
mod update;

pub use events::{EventBus, MutationEvent, MutationEventKind, Subscription, SubscriptionId};
pub use manager::{BatchOperation, MutationOutcome, OptimisticManager};
pub use retry::backoff_delay;
pub use update::{entity_key, Operation, OptimisticUpdate, UpdateStatus};
