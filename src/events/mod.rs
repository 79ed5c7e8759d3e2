//! Chain event subscriptions

pub mod hub;

pub use hub::{PublishStats, Subscription, SubscriptionHub, SubscriptionId, Topic};
