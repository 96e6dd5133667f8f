use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher '{0}' is not registered")]
    UnknownDispatcher(String),

    #[error("Requirement cycle detected at task '{0}'")]
    Cycle(String),

    #[error("Task '{0}':\n{1}")]
    Execute(String, anyhow::Error),

    #[error("Couldn't create job directory '{0}'.\n{1}")]
    JobDirectory(Utf8PathBuf, std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node '{node}' only accepts requirement inputs, got '{source_node}.{source_plug}'")]
    RejectedInput {
        node: String,
        source_node: String,
        source_plug: String,
    },

    #[error("Node '{node}' has no requirement input at index {index}")]
    NoSuchInput { node: String, index: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse dispatcher configuration.\n{0}")]
    Json(#[from] serde_json::Error),
}
