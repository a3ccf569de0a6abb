use thiserror::Error;

/// Marker the browser backend puts in rate-limit failures.
const RATE_LIMIT_MARKER: &str = "too many requests";

/// Failure of a single browser-session call.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("{0}")]
    Failed(String),
}

impl FetchError {
    /// Classify a raw backend failure message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            FetchError::RateLimited(message)
        } else {
            FetchError::Failed(message)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            FetchError::RateLimited(err.to_string())
        } else {
            FetchError::from_message(err.to_string())
        }
    }
}

/// Textual marker only. Numeric 429 statuses are classified where the
/// status is a field, never by scanning message text.
pub fn is_rate_limit_message(message: &str) -> bool {
    message.to_lowercase().contains(RATE_LIMIT_MARKER)
}

/// Outcome of the retry loop for one record.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("gave up on {url} after {attempts} rate-limited attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: FetchError,
    },
    #[error("failed to fetch {url}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Unsupported file type: {0}")]
    UnsupportedExtension(String),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no candidate download links to choose from")]
    NoCandidateLinks,
    #[error("model chose {chosen:?}, which is not one of the {candidates} candidate links")]
    LinkNotInCandidates { chosen: String, candidates: usize },
    #[error("model refused: {0}")]
    Refused(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_messages() {
        assert!(FetchError::from_message("HTTP 429 Too Many Requests").is_rate_limited());
        assert!(FetchError::from_message("too many requests, slow down").is_rate_limited());
        assert!(!FetchError::from_message("net::ERR_NAME_NOT_RESOLVED").is_rate_limited());
    }

    #[test]
    fn status_digits_in_a_url_are_not_a_rate_limit() {
        let err = FetchError::from_message(
            "error sending request for url (https://data.sfgov.org/Housing/Permits/k429-ab3x)",
        );
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn exhausted_error_keeps_last_failure() {
        let err = ScrapeError::RetriesExhausted {
            url: "https://example.org".into(),
            attempts: 3,
            last: FetchError::RateLimited("Too Many Requests".into()),
        };
        assert_eq!(
            err.to_string(),
            "gave up on https://example.org after 3 rate-limited attempts"
        );
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "rate limited: Too Many Requests");
    }
}
