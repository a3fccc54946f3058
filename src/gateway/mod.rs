//! Gateway server implementation

mod failover;
mod poller;
mod rejection;
mod router;
mod server;

pub use failover::{FailoverRouter, InboundRequest};
pub use poller::{HealthPoller, HealthReport, OriginReport, ProbeResult, health_json};
pub use rejection::Rejection;
pub use router::{AppState, create_router};
pub use server::Gateway;
