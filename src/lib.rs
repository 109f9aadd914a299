pub mod engine;
mod error;
pub mod http;
pub mod stats;
pub mod types;
pub mod upstream;
mod utils;

pub use engine::{Engine, EngineConfig};
pub use error::{BatchgateError, Result};
pub use http::{router, ProxyState, DEFAULT_RELAY_ORIGIN};
pub use stats::{ProxyStats, StatsSnapshot};
pub use upstream::{OpenAiUpstream, Upstream, DEFAULT_BASE_URL};
