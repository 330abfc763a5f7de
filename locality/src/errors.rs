#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// The box used to define periodic boundary conditions is malformed
    InvalidBox(String),
    /// The reference indices given to a bond list are not sorted, the first
    /// out-of-order entry is at `position`
    UnsortedIndex {
        position: usize,
    },
    /// An index given to a bond list is larger than the number of points it
    /// refers to
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        bound: usize,
    },
    /// Arrays given together to a function do not have matching sizes
    SizeMismatch(String),
    /// The neighbor engine does not support the requested kind of operation
    NotQueryable(String),
    /// The adaptive nearest neighbors search could not find enough neighbors
    /// before running out of search radius
    RadiusExpansionExhausted {
        r_max: f64,
        iterations: usize,
    },
    /// Got an invalid parameter value in a function
    InvalidParameter(String),
    /// Error while serializing/deserializing data
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidBox(e) => write!(f, "invalid box: {}", e),
            Error::UnsortedIndex { position } => write!(
                f, "reference indices must be sorted, but entry {} is smaller than the previous one", position
            ),
            Error::IndexOutOfRange { kind, index, bound } => write!(
                f, "{} index {} is out of range for {} points", kind, index, bound
            ),
            Error::SizeMismatch(e) => write!(f, "size mismatch: {}", e),
            Error::NotQueryable(e) => write!(f, "operation not supported: {}", e),
            Error::RadiusExpansionExhausted { r_max, iterations } => write!(
                f, "could not grow the search radius any further (r_max = {} after {} iterations)",
                r_max, iterations
            ),
            Error::InvalidParameter(e) => write!(f, "invalid parameter: {}", e),
            Error::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidBox(_) |
            Error::UnsortedIndex { .. } |
            Error::IndexOutOfRange { .. } |
            Error::SizeMismatch(_) |
            Error::NotQueryable(_) |
            Error::RadiusExpansionExhausted { .. } |
            Error::InvalidParameter(_) => None,
            Error::Json(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::Json(error)
    }
}
