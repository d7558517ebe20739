use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device Runtime Error: {0}")]
    Driver(String),

    #[error("Out of GPU Memory ({requested} bytes requested)")]
    OutOfMemory { requested: u64 },

    /// The runtime refused an allocation even after the pool was flushed.
    #[error("Device memory exhausted: {requested} bytes could not be secured")]
    ResourceExhausted {
        requested: u64,
        #[source]
        source: Box<PoolError>,
    },

    /// Non-fatal. Only ever logged, the accounting is updated regardless.
    #[error("Native free of {bytes} bytes failed")]
    NativeFreeFailed {
        bytes: u64,
        #[source]
        source: Box<PoolError>,
    },

    #[error("Invalid pool configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Request of {raw_size} bytes overflows the bucket key")]
    SizeOverflow { raw_size: u64 },
}

// A convenient alias
pub type PoolResult<T> = Result<T, PoolError>;
