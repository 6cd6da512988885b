use palaver_core::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Distinguished error kind; never represented by a zero value.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("credentials rejected")]
    CredentialsRejected,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => EngineError::TopicNotFound(what),
            StoreError::CredentialsRejected => EngineError::AuthRequired,
            other => EngineError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguished() {
        assert!(StoreError::NotFound("grp1".into()).is_not_found());
        assert!(!StoreError::Backend("io".into()).is_not_found());
    }

    #[test]
    fn converts_to_engine_error() {
        let err: EngineError = StoreError::NotFound("grp1".into()).into();
        assert_eq!(err.ctrl_code(), 404);
        let err: EngineError = StoreError::Backend("io".into()).into();
        assert_eq!(err.ctrl_code(), 500);
    }
}
