use thiserror::Error;

/// The full error taxonomy exposed to callers of the engine.
///
/// Internal plumbing (writer actor threads, scheduler loops) uses
/// `anyhow::Result`; those errors are converted into one of these variants
/// at the service boundary so every user-visible response carries a stable,
/// matchable error kind.
#[derive(Debug, Error)]
pub enum FlexError {
    #[error("index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("index '{0}' is offline")]
    IndexIsOffline(String),

    #[error("index '{0}' is still opening")]
    IndexIsOpening(String),

    #[error("index '{0}' has no registration, this is a bug")]
    IndexRegistrationMissing(String),

    #[error("failed to open index writer: {0}")]
    OpeningIndexWriter(String),

    #[error("version mismatch for document '{0}'")]
    VersionMismatch(String),

    #[error("document id is missing or empty")]
    MissingId,

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{0}' is store-only and cannot be queried")]
    StoreOnlyField(String),

    #[error("unknown query operator '{0}'")]
    UnknownQueryOperator(String),

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("unknown search profile '{0}'")]
    UnknownSearchProfile(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

pub type FlexResult<T> = Result<T, FlexError>;

impl From<tantivy::TantivyError> for FlexError {
    fn from(e: tantivy::TantivyError) -> Self {
        FlexError::OpeningIndexWriter(e.to_string())
    }
}

impl From<anyhow::Error> for FlexError {
    fn from(e: anyhow::Error) -> Self {
        FlexError::ValidationFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let e = FlexError::IndexNotFound("orders".into());
        assert_eq!(e.to_string(), "index 'orders' not found");
    }

    #[test]
    fn missing_id_has_no_payload() {
        let e = FlexError::MissingId;
        assert_eq!(e.to_string(), "document id is missing or empty");
    }
}
