use std::fmt;

pub use common::params::ErrorCode;

/// Domain error carrying a stable machine-readable code, a human message and
/// the preserved root cause. Callers classify with [`Error::code`]; the
/// message is never matched on.
#[derive(Debug)]
pub struct Error {
    code: ErrorCode,
    message: String,
    cause: Option<anyhow::Error>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, msg)
    }

    pub fn ambiguous_choice(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::AmbiguousChoice, msg)
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, msg)
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, msg)
    }

    pub fn upgrade_in_progress(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpgradeInProgress, msg)
    }

    pub fn server_configuration(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerConfiguration, msg)
    }

    pub fn api_connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiConnection, msg)
    }

    pub fn invalid_model_params(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidModelParams, msg)
    }

    pub fn monitoring_stopped(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::MonitoringStopped, msg)
    }

    pub fn bad_id(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadId, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    /// Attaches the root cause, keeping this error's code and message.
    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Prepends context to the message, keeping the code and cause intact.
    /// The analogue of annotating an error while letting callers keep
    /// matching on its cause.
    pub fn context(mut self, msg: impl fmt::Display) -> Self {
        self.message = format!("{msg}: {}", self.message);
        self
    }

    /// Re-tags this error with a new code, preserving the original error as
    /// the cause.
    pub fn mask(self, code: ErrorCode, msg: impl Into<String>) -> Self {
        Error {
            code,
            message: msg.into(),
            cause: Some(anyhow::Error::new(self)),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error {
                code: ErrorCode::Internal,
                message: err.to_string(),
                cause: Some(err),
            },
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error {
            code: ErrorCode::Internal,
            message: "database error".to_string(),
            cause: Some(err.into()),
        }
    }
}

/// Returns the classification code of any error, treating non-domain errors
/// as internal.
pub fn error_code(err: &Error) -> ErrorCode {
    err.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_code() {
        let err = Error::not_found("credential \"aws/alice/x\" not found").context("cannot get credential");
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(err.to_string().starts_with("cannot get credential: "));
    }

    #[test]
    fn mask_keeps_original_as_cause() {
        let inner = Error::not_found("no such row");
        let outer = inner.mask(ErrorCode::Unauthorized, "unauthorized");
        assert_eq!(outer.code(), ErrorCode::Unauthorized);
        let source = std::error::Error::source(&outer).expect("cause retained");
        assert!(source.to_string().contains("no such row"));
    }

    #[test]
    fn anyhow_round_trip_keeps_domain_code() {
        let err = Error::ambiguous_choice("more than one possible credential to use");
        let through: Error = anyhow::Error::new(err).into();
        assert_eq!(through.code(), ErrorCode::AmbiguousChoice);
    }
}
