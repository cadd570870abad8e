pub mod schema;

pub use schema::{
    Config, GatewayConfig, HeartbeatConfig, MediaConfig, ReliabilityConfig, SessionConfig,
    StoreConfig,
};
