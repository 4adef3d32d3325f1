use crate::inference::InferenceError;
use crate::model::RunStatus;
use std::time::Duration;
use thiserror::Error;

/// Job-level failure taxonomy. Every variant maps onto a run outcome status.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no rendering capacity within {0:?}")]
    PoolExhausted(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page load timed out after {0:?}")]
    PageTimeout(Duration),
    #[error("page structure invalid: {0}")]
    StructureInvalid(String),
    #[error("job exceeded {0:?}")]
    JobTimeout(Duration),
    #[error("rendering engine error: {0}")]
    Engine(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

impl ScrapeError {
    pub fn run_status(&self) -> RunStatus {
        match self {
            ScrapeError::PageTimeout(_) | ScrapeError::JobTimeout(_) => RunStatus::Timeout,
            ScrapeError::Inference(e) if e.is_timeout() => RunStatus::Timeout,
            _ => RunStatus::Error,
        }
    }

    /// Whether the rendering context that produced this error can go back to the pool.
    pub fn context_reusable(&self) -> bool {
        !matches!(self, ScrapeError::Engine(_) | ScrapeError::PageTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_map_to_timeout_status() {
        let d = Duration::from_secs(1);
        assert_eq!(ScrapeError::PageTimeout(d).run_status(), RunStatus::Timeout);
        assert_eq!(ScrapeError::JobTimeout(d).run_status(), RunStatus::Timeout);
        assert_eq!(
            ScrapeError::Navigation("HTTP 404".into()).run_status(),
            RunStatus::Error
        );
        assert_eq!(
            ScrapeError::StructureInvalid("no table".into()).run_status(),
            RunStatus::Error
        );
        assert_eq!(ScrapeError::PoolExhausted(d).run_status(), RunStatus::Error);
    }
}
