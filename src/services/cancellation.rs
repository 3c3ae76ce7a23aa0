use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Characters of the tenant key kept in the token file name.
const READABLE_PREFIX_LEN: usize = 32;

/// Per-tenant stop flags kept as marker files in an ephemeral directory.
///
/// A present marker means "proceed", an absent one means "stop". Absence is
/// sticky: nothing but a new job start re-creates the marker. Workers poll
/// the marker at their own checkpoints; nothing here interrupts them.
#[derive(Debug, Clone)]
pub struct CancellationTokens {
    dir: PathBuf,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A marker was removed; the worker stops at its next checkpoint.
    Acknowledged,
    /// No marker existed: never started, finished, or already stopped.
    AlreadyStopped,
}

impl StopOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StopOutcome::Acknowledged => "Stop signal sent",
            StopOutcome::AlreadyStopped => "Job already stopped or finished",
        }
    }
}

impl CancellationTokens {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the token directory if needed.
    pub async fn ensure_dir(&self) -> Result<(), TokenError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| TokenError::Io {
                path: self.dir.clone(),
                source,
            })
    }

    /// Marker location for a tenant. Always a direct child of the token
    /// directory, whatever the key contains.
    pub fn token_path(&self, db_name: &str) -> PathBuf {
        self.dir.join(token_file_name(db_name))
    }

    /// Create the tenant's marker, returning its path.
    pub async fn arm(&self, db_name: &str) -> Result<PathBuf, TokenError> {
        self.ensure_dir().await?;
        let path = self.token_path(db_name);
        tokio::fs::write(&path, b"")
            .await
            .map_err(|source| TokenError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Whether the tenant's marker exists. Unreadable counts as absent.
    pub async fn is_armed(&self, db_name: &str) -> bool {
        marker_present(&self.token_path(db_name)).await
    }

    /// Remove the tenant's marker.
    pub async fn stop(&self, db_name: &str) -> Result<StopOutcome, TokenError> {
        let path = self.token_path(db_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(StopOutcome::Acknowledged),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(StopOutcome::AlreadyStopped),
            Err(source) => Err(TokenError::Io { path, source }),
        }
    }
}

/// Whether a marker file exists at `path`.
pub async fn marker_present(path: &Path) -> bool {
    match tokio::fs::try_exists(path).await {
        Ok(present) => present,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cancellation token unreadable");
            false
        }
    }
}

fn token_file_name(db_name: &str) -> String {
    let readable: String = db_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(READABLE_PREFIX_LEN)
        .collect();
    let digest = hex::encode(Sha256::digest(db_name.as_bytes()));
    format!("{readable}-{}.run", &digest[..16])
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Cancellation token I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
