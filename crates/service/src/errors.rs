use std::path::PathBuf;

use thiserror::Error;

/// Errors originating in the service crate itself.
///
/// Collaborator failures (worker or channel creation) arrive as
/// [`anyhow::Error`] from the factories and are handled inside the
/// controller; they never surface through this type.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Could not read the configuration file.
    #[error("failed to read config file {path}")]
    ConfigRead {
        /// Path we tried to read.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file was not valid TOML for our schema.
    #[error("failed to parse config file {path}")]
    ConfigParse {
        /// Path we tried to parse.
        path: PathBuf,

        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
}
