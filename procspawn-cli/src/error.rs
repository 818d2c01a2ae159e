#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("spawn error: {0}")]
    Spawn(#[from] procspawn::SpawnError),

    #[error("config error: {0}")]
    Config(String),

    #[error("cannot resolve {program}: {source}")]
    Resolve {
        program: String,
        source: which::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;
