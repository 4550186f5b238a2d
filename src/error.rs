use thiserror::Error;

/// Error taxonomy for the ingestion -> aggregation -> fan-out pipeline.
///
/// Most variants are handled at the call site per the policy documented in
/// spec §7; this type exists so call sites can `match` on the kind instead
/// of inspecting strings.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize store: {0}")]
    StoreInit(String),

    #[error("store schema error: {0}")]
    StoreSchema(String),

    #[error("store i/o error: {0}")]
    StoreIO(#[from] rusqlite::Error),

    #[error("transient ingress error: {0}")]
    TransientIO(String),

    #[error("dropped unclean record")]
    ParseDirty,

    #[error("subscriber queue full, delta dropped")]
    SubscriberSlow,

    #[error("client disconnected")]
    ClientClosed,

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
