/// Shared error type used across all SerialAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("SerialMemory: {0}")]
    SerialMemory(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("topic mismatch: socket is bound to a different topic")]
    TopicMismatch,

    #[error("sandbox creation timed out after {0}ms")]
    SandboxCreateTimeout(u64),

    #[error("runner RPC timed out after {0}ms")]
    RunnerRpcTimeout(u64),

    #[error("question mismatch: {0}")]
    QuestionMismatch(String),

    #[error("question expired: {0}")]
    QuestionExpired(String),

    #[error("event bus: {0}")]
    EventBus(String),

    #[error("wallet: {0}")]
    Wallet(String),

    #[error("unsupported sandbox operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
