use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `ARBOR_DATABASE_URL` environment variable, falling back to
/// a SQLite file under the platform data directory.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL (`sqlite:///path/to/arbor.db`).
    pub database_url: String,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `ARBOR_DATABASE_URL` env var, then the platform default.
    pub fn from_env() -> Self {
        let database_url =
            env::var("ARBOR_DATABASE_URL").unwrap_or_else(|_| Self::default_url());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// The default connection URL: `sqlite://<data_dir>/arbor/arbor.db`.
    pub fn default_url() -> String {
        format!("sqlite://{}", Self::default_path().display())
    }

    /// The default on-disk database path.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arbor")
            .join("arbor.db")
    }

    /// Extract the filesystem path from the URL, if it points at a file.
    ///
    /// Returns `None` for in-memory databases.
    pub fn database_path(&self) -> Option<PathBuf> {
        let rest = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))?;
        if rest.is_empty() || rest == ":memory:" {
            return None;
        }
        Some(PathBuf::from(rest))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
