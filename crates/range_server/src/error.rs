//! Error taxonomy for the range server.
//!
//! Every per-request failure carries a stable numeric code so the dispatch
//! layer can pack it into response frames and the update path can pack it
//! into send-back records.

/// Stable numeric error codes used in response frames.
pub mod code {
    pub const OK: u32 = 0;

    // Configuration errors (fatal at startup).
    pub const CONFIG_BAD_VALUE: u32 = 0x0001_0001;

    // Protocol errors.
    pub const PROTOCOL_ERROR: u32 = 0x0002_0001;
    pub const MALFORMED_REQUEST: u32 = 0x0002_0002;
    pub const REQUEST_TRUNCATED: u32 = 0x0002_0003;
    pub const BAD_SCAN_SPEC: u32 = 0x0002_0004;

    // Routing errors.
    pub const TABLE_NOT_FOUND: u32 = 0x0003_0001;
    pub const RANGE_NOT_FOUND: u32 = 0x0003_0002;
    pub const RANGE_ALREADY_LOADED: u32 = 0x0003_0003;
    pub const OUT_OF_RANGE: u32 = 0x0003_0004;

    // Data errors.
    pub const BAD_KEY: u32 = 0x0004_0001;
    pub const REVISION_ORDER_ERROR: u32 = 0x0004_0002;
    pub const CLOCK_SKEW: u32 = 0x0004_0003;
    pub const SCHEMA_PARSE_ERROR: u32 = 0x0004_0004;
    pub const GENERATION_MISMATCH: u32 = 0x0004_0005;
    pub const INVALID_SCANNER_ID: u32 = 0x0004_0006;

    // Infrastructure errors.
    pub const IO_ERROR: u32 = 0x0005_0001;
    pub const REQUEST_TIMEOUT: u32 = 0x0005_0002;
}

/// Range server errors surfaced to request callers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("bad config value: {0}")]
    ConfigBadValue(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("request truncated: {0}")]
    RequestTruncated(String),
    #[error("bad scan spec: {0}")]
    BadScanSpec(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("range not found: {0}")]
    RangeNotFound(String),
    #[error("range already loaded: {0}")]
    RangeAlreadyLoaded(String),
    #[error("row out of range: {0}")]
    OutOfRange(String),
    #[error("bad key: {0}")]
    BadKey(String),
    #[error("revision order error: {0}")]
    RevisionOrder(String),
    #[error("clock skew of {skew_us} microseconds exceeds maximum ({max_us}) range={range}")]
    ClockSkew {
        skew_us: i64,
        max_us: i64,
        range: String,
    },
    #[error("schema parse error: {0}")]
    SchemaParse(String),
    #[error("schema generation mismatch: {0}")]
    GenerationMismatch(String),
    #[error("invalid scanner id: {0}")]
    InvalidScannerId(u32),
    #[error("io error: {0}")]
    Io(String),
    #[error("request timeout: {0}")]
    RequestTimeout(String),
}

impl Error {
    /// Numeric code for response frames and send-back records.
    pub fn code(&self) -> u32 {
        match self {
            Error::ConfigBadValue(_) => code::CONFIG_BAD_VALUE,
            Error::Protocol(_) => code::PROTOCOL_ERROR,
            Error::MalformedRequest(_) => code::MALFORMED_REQUEST,
            Error::RequestTruncated(_) => code::REQUEST_TRUNCATED,
            Error::BadScanSpec(_) => code::BAD_SCAN_SPEC,
            Error::TableNotFound(_) => code::TABLE_NOT_FOUND,
            Error::RangeNotFound(_) => code::RANGE_NOT_FOUND,
            Error::RangeAlreadyLoaded(_) => code::RANGE_ALREADY_LOADED,
            Error::OutOfRange(_) => code::OUT_OF_RANGE,
            Error::BadKey(_) => code::BAD_KEY,
            Error::RevisionOrder(_) => code::REVISION_ORDER_ERROR,
            Error::ClockSkew { .. } => code::CLOCK_SKEW,
            Error::SchemaParse(_) => code::SCHEMA_PARSE_ERROR,
            Error::GenerationMismatch(_) => code::GENERATION_MISMATCH,
            Error::InvalidScannerId(_) => code::INVALID_SCANNER_ID,
            Error::Io(_) => code::IO_ERROR,
            Error::RequestTimeout(_) => code::REQUEST_TIMEOUT,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, Error>;
