use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy shared by every stage of the pipeline.
///
/// Services return `anyhow::Result`; these values ride inside the
/// `anyhow::Error` and are recovered with [`GenerationError::of`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("Model response could not be parsed: {0}")]
    UnparsableResponse(String),

    #[error("Content rejected by the generator")]
    ContentRejected,

    #[error("No credential configured for {0}")]
    NoCredential(String),

    #[error("Backend returned HTTP {status}: {message}")]
    BackendHttp { status: u16, message: String },

    #[error("Rate limited by backend")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Backend request timed out")]
    Timeout,

    #[error("Generator unavailable: {0}")]
    GeneratorUnavailable(String),

    #[error("Backend returned no image")]
    NoImageProduced,

    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn of(err: &anyhow::Error) -> Option<&GenerationError> {
        err.downcast_ref::<GenerationError>()
    }

    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(Self::of(err), Some(GenerationError::Cancelled))
    }

    /// Errors no amount of retrying can fix.
    pub fn is_fatal(err: &anyhow::Error) -> bool {
        matches!(
            Self::of(err),
            Some(GenerationError::Cancelled) | Some(GenerationError::NoCredential(_))
        )
    }

    /// Transient failures worth repeating the identical request for.
    pub fn is_transient(err: &anyhow::Error) -> bool {
        match Self::of(err) {
            Some(GenerationError::RateLimited { .. }) | Some(GenerationError::Timeout) => true,
            Some(GenerationError::BackendHttp { status, .. }) => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after(err: &anyhow::Error) -> Option<Duration> {
        match Self::of(err) {
            Some(GenerationError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> anyhow::Error {
        if err.is_timeout() {
            anyhow::Error::new(GenerationError::Timeout)
        } else {
            anyhow::Error::new(err)
        }
    }

    /// Maps a non-success HTTP response onto the taxonomy, passing successes through.
    pub async fn check_response(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(GenerationError::RateLimited { retry_after }.into());
        }

        let message = resp.text().await.unwrap_or_default();
        Err(GenerationError::BackendHttp {
            status: status.as_u16(),
            message: message.chars().take(500).collect(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classification_survives_context() {
        let err: anyhow::Result<()> = Err(GenerationError::Cancelled.into());
        let err = err.context("while drawing page 3").unwrap_err();
        assert!(GenerationError::is_cancelled(&err));
        assert!(GenerationError::is_fatal(&err));
    }

    #[test]
    fn test_transient_errors() {
        let limited = anyhow::Error::new(GenerationError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        });
        assert!(GenerationError::is_transient(&limited));
        assert_eq!(GenerationError::retry_after(&limited), Some(Duration::from_secs(7)));

        let server = anyhow::Error::new(GenerationError::BackendHttp {
            status: 503,
            message: "busy".to_string(),
        });
        assert!(GenerationError::is_transient(&server));

        let rejected = anyhow::Error::new(GenerationError::BackendHttp {
            status: 400,
            message: "content_policy_violation".to_string(),
        });
        assert!(!GenerationError::is_transient(&rejected));
        assert!(!GenerationError::is_fatal(&rejected));

        let missing_key = anyhow::Error::new(GenerationError::NoCredential("openai".to_string()));
        assert!(GenerationError::is_fatal(&missing_key));
        assert!(!GenerationError::is_transient(&anyhow::anyhow!("plain failure")));
    }
}
