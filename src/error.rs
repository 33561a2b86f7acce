use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebindError {
    #[error("failed to parse address {addr:?}: {reason}")]
    AddressParse { addr: String, reason: String },

    #[error("no pool address meets the lease criteria")]
    PoolExhausted,

    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
