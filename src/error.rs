use thiserror::Error;

pub type Result<T> = std::result::Result<T, MallornError>;

#[derive(Error, Debug)]
pub enum MallornError {
    #[error("Branch error: {0}")]
    Branch(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FUSE error: {0}")]
    Fuse(String),
}
