use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport unreachable: {0}")]
    Connectivity(String),
    #[error("malformed payload: {0}")]
    MalformedData(String),
    #[error("queue error: {0}")]
    Amqp(Box<lapin::Error>),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
}

impl From<lapin::Error> for EngineError {
    fn from(value: lapin::Error) -> Self {
        Self::Amqp(Box::new(value))
    }
}
