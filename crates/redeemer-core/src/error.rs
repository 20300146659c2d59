//! Error types for redeemer-core
//!
//! Only run-fatal conditions become [`Error`] values. Per-key failures are
//! contained by the redemption loop and recorded in the ledger instead.

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
    /// Whether the fix requires a human (re-authentication etc.)
    pub manual_action: bool,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
            manual_action: false,
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Mark the remediation as requiring human intervention
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.manual_action = true;
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        if self.manual_action {
            let _ = writeln!(output, "Manual action required:");
        } else {
            let _ = writeln!(output, "To fix:");
        }
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a run that needs the user to sign in again.
pub const EXIT_NEEDS_LOGIN: i32 = 2;
/// Exit code for a run stopped by the shutdown signal.
pub const EXIT_CANCELLED: i32 = 130;
/// Exit code for every other fatal error.
pub const EXIT_FAILURE: i32 = 1;

/// Main error type for redeemer-core
#[derive(Error, Debug)]
pub enum Error {
    /// Authentication/session errors from either collaborator
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Catalog cache errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Ledger persistence errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transient transport failure that survived local retries
    #[error("Network error: {0}")]
    Network(String),

    /// Operation was cancelled by the shutdown signal
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Session(err) => Some(err.remediation()),
            Self::Catalog(err) => Some(err.remediation()),
            Self::Ledger(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Status", "redeemer status")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check the key export file for truncation or invalid UTF-8."),
            ),
            Self::Network(_) => Some(
                Remediation::new("The platform could not be reached. Try again later.")
                    .alternative("Check network connectivity and platform status."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new("Run was cancelled. Re-run to resume; completed keys are skipped.")
                    .command("Status", "redeemer status"),
            ),
        }
    }

    /// True when the run cannot continue until a human signs in again.
    #[must_use]
    pub fn needs_manual_login(&self) -> bool {
        matches!(self, Self::Session(_))
    }

    /// True for errors worth retrying locally with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            Self::Catalog(CatalogError::Fetch(_)) => true,
            _ => false,
        }
    }

    /// Process exit code a supervisor can branch on.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.needs_manual_login() {
            EXIT_NEEDS_LOGIN
        } else if matches!(self, Self::Cancelled(_)) {
            EXIT_CANCELLED
        } else {
            EXIT_FAILURE
        }
    }
}

/// Session invalidation reported by a collaborator
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session was valid once but the service no longer accepts it
    #[error("{service} session expired")]
    Expired { service: String },

    /// Required session material was not supplied
    #[error("{service} credentials missing: {what}")]
    MissingCredentials { service: String, what: String },

    /// The service rejected the session outright
    #[error("{service} rejected the session (HTTP {status})")]
    Rejected { service: String, status: u16 },
}

impl SessionError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Expired { service } | Self::Rejected { service, .. } => Remediation::new(
                format!("Sign in to {service} again and refresh the stored session."),
            )
            .manual()
            .alternative("Export fresh session cookies, then re-run; progress is preserved."),
            Self::MissingCredentials { service, what } => {
                Remediation::new(format!("Provide {what} for {service}."))
                    .manual()
                    .command("Show config", "redeemer status")
                    .alternative("Set the value in redeemer.toml or the environment.")
            }
        }
    }
}

/// Catalog cache errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Fetching from the platform failed
    #[error("catalog fetch failed: {0}")]
    Fetch(String),

    /// Cached file failed checksum verification
    #[error("cache checksum mismatch in {path}")]
    ChecksumMismatch { path: String },

    /// A freshly rebuilt cache still fails verification
    #[error("cache checksum mismatch in {path} after rebuild")]
    ChecksumMismatchAfterRebuild { path: String },

    /// Cache was written by an incompatible version
    #[error("cache version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
}

impl CatalogError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Fetch(_) => Remediation::new("Catalog fetch failed. Try again later.")
                .command("Rebuild catalog", "redeemer catalog refresh")
                .alternative("Verify the platform API key is valid."),
            Self::ChecksumMismatch { path } | Self::ChecksumMismatchAfterRebuild { path } => {
                Remediation::new(format!("Delete the corrupt cache file {path} and rebuild."))
                    .command("Rebuild catalog", "redeemer catalog refresh")
                    .alternative("Check the disk for errors if corruption recurs.")
            }
            Self::VersionMismatch { .. } => {
                Remediation::new("Cache format changed. Rebuild the catalog cache.")
                    .command("Rebuild catalog", "redeemer catalog refresh")
            }
        }
    }
}

/// Ledger persistence errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Advisory lock could not be taken
    #[error("failed to lock ledger at {path}: {message}")]
    Lock { path: String, message: String },

    /// A ledger file could not be written or replaced
    #[error("failed to write ledger file {path}: {message}")]
    Write { path: String, message: String },

    /// A ledger file could not be read
    #[error("failed to read ledger file {path}: {message}")]
    Read { path: String, message: String },
}

impl LedgerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Lock { path, .. } => {
                Remediation::new(format!("Another process holds the ledger lock at {path}."))
                    .alternative("Wait for the other run to finish, then retry.")
            }
            Self::Write { path, .. } | Self::Read { path, .. } => Remediation::new(format!(
                "Check permissions and free space for {path}, then retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .command("Deduplicate errored keys", "redeemer ledger cleanup"),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseError(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .alternative("Validate the TOML file format."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("Review validation errors and adjust redeemer.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
