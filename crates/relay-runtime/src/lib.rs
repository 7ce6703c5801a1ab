pub mod channels;
pub mod dispatch;
pub mod gateway;
pub mod hooks;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod supervisor;

pub use channels::{ChannelIndex, History, Subscription};
pub use dispatch::Dispatcher;
pub use gateway::{GatewayContext, GatewayServer, JwtVerifier, StaticTokenVerifier};
pub use hooks::RelayHooks;
pub use metrics::{Metrics, MetricsSnapshot};
pub use queue::{
    store_key, DeliveryOutcome, MemoryQueueStore, OfflineQueue, QueueStats, QueueStore,
    QueuedMessage,
};
pub use registry::{Connection, ConnectionRegistry, OutboundFrame, OutboundQueue, PushOutcome};
pub use supervisor::Supervisor;
