use thiserror::Error;

/// Errors surfaced by the dispatch core.
///
/// Configuration variants are returned at session start and refuse to build
/// the context. `NoRoute` is returned per packet. Rebalance variants are
/// reported by a tick and leave the previously published vector in place.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid bitrate bounds: {0}")]
    InvalidBounds(String),

    #[error("link set is empty")]
    EmptyLinkSet,

    #[error("invalid weight {weight} for link {link}")]
    InvalidWeight { link: usize, weight: f64 },

    #[error("unknown link id {0}")]
    UnknownLink(usize),

    /// Every link has weight 0. The caller decides whether to drop or hold.
    #[error("no link with positive weight")]
    NoRoute,

    #[error("{healthy} healthy links, at least {required} required")]
    InsufficientHealthyLinks { healthy: usize, required: usize },

    #[error("malformed sample on link {link}: {reason}")]
    MalformedSample { link: usize, reason: &'static str },

    #[error("weight vector has {got} entries, expected {expected}")]
    LengthMismatch { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = DispatchError::InvalidWeight {
            link: 2,
            weight: -1.0,
        };
        assert_eq!(err.to_string(), "invalid weight -1 for link 2");

        let err = DispatchError::InsufficientHealthyLinks {
            healthy: 0,
            required: 1,
        };
        assert!(err.to_string().contains("at least 1"));
    }
}
