pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod sink;
pub mod transport;
pub mod types;

pub use config::{BackendKind, EngineConfig, EngineSettings};
pub use engine::run_engine;
pub use error::EngineError;
pub use sink::{AlertSeverity, GridAlert, LogSink, SinkStatus, UiSink};
pub use transport::{MeterTransport, SubmissionOutcome};
pub use types::{ConnectionState, MeterReading};
