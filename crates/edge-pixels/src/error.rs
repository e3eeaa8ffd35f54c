use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PixelError {
    /// Buffer length, plane offsets or strides do not describe the declared
    /// dimensions.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("{operation} does not accept {format} frames")]
    UnsupportedFormat {
        operation: &'static str,
        format: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, PixelError>;
