//! Session-level error type
//!
//! Every [`AppSession`](crate::session::AppSession) method returns
//! [`AppError`]. Its `Display` text is what a user sees.

use crate::config::ConfigError;
use crate::download::DownloadError;
use crate::load_order::LoadOrderError;
use crate::mutator::MutationError;
use crate::vpk::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    LoadOrder(#[from] LoadOrderError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Archive not in catalog: {0}")]
    UnknownArchive(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// "Feature unavailable" errors: fixed by configuration, not by retrying
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::LoadOrder(LoadOrderError::Missing(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_configuration_class() {
        assert!(AppError::from(ConfigError::RootNotSet).is_configuration());
        assert!(AppError::from(LoadOrderError::Missing(PathBuf::from("addonlist.txt"))).is_configuration());
        assert!(!AppError::from(MutationError::NotFound(PathBuf::from("a.vpk"))).is_configuration());
        assert!(!AppError::Task("join".to_string()).is_configuration());
    }

    #[test]
    fn test_display_is_user_facing() {
        let err = AppError::from(ConfigError::RootNotSet);
        assert_eq!(err.to_string(), "No addons directory selected");

        let err = AppError::from(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "outer: inner");
    }
}
