pub mod crypto;
pub mod error;
pub mod logger;
pub mod metrics;

pub use crypto::{CryptoUtils, ID_LEN};
pub use error::{PdnError, Result};
pub use logger::setup_logging;
pub use metrics::{MetricsCollector, NodeMetrics};
