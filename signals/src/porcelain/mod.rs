pub mod subscribe;

pub use subscribe::{IntoSubscribeListener, Subscribe, SubscriptionGuard};
