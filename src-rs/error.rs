use thiserror::Error;

/// Errors surfaced by one agent cycle.
///
/// Oracle and validation failures are retried inside the cycle; capture and
/// injection failures are environment problems and end the run at once.
/// Composition failures are invariant violations and always fatal.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),

    #[error("composition: {0}")]
    Composition(#[from] CompositionError),

    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),

    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("injection: {0}")]
    Injection(#[from] InjectionError),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Oracle(_) | Self::Validation(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture",
            Self::Composition(_) => "composition",
            Self::Oracle(_) => "oracle",
            Self::Validation(_) => "validation",
            Self::Injection(_) => "injection",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no monitor available")]
    NoMonitor,

    #[error("capture surface unavailable: {0}")]
    Unavailable(String),

    #[error("captured an empty {width}x{height} frame")]
    Empty { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("buffer shape mismatch: desktop {desktop:?} vs overlay {overlay:?}")]
    ShapeMismatch {
        desktop: (u32, u32),
        overlay: (u32, u32),
    },

    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("oracle returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("empty response")]
    Empty,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("response contains no JSON object")]
    NoJson,

    #[error("malformed action JSON: {0}")]
    Malformed(String),

    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("missing field `{0}`")]
    Missing(&'static str),

    #[error("field `{0}` is not numeric")]
    NotNumeric(&'static str),

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("field `{0}` must not be empty")]
    Empty(&'static str),

    #[error("field `{field}` too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("scroll needs a non-zero dx or dy")]
    NoScroll,

    #[error("unknown label `{0}`")]
    UnknownLabel(String),
}

#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("input backend unavailable: {0}")]
    Unavailable(String),

    #[error("OS rejected {event}: {message}")]
    Rejected { event: String, message: String },
}
