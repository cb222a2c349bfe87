use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("write: {0}")]
    Serialize(#[from] ron::Error),
}

/// Bad `--frame` argument.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameArgError {
    #[error("expected BUS:ID:DATA, got {0:?}")]
    Shape(String),
    #[error("bad identifier {0:?}")]
    Id(String),
    #[error("bad payload {0:?}, expected up to eight hex bytes")]
    Data(String),
}
