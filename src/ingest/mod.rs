pub mod backfill;
pub mod connection;
pub mod health;
pub mod orchestrator;
pub mod registry;
pub mod subscriptions;
pub mod window;

pub use backfill::Backfiller;
pub use connection::ConnectionController;
pub use health::StreamHealthMonitor;
pub use orchestrator::IngestionOrchestrator;
pub use registry::PairRegistry;
pub use subscriptions::SubscriptionManager;
pub use window::WindowMaintainer;
