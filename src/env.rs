//! Runtime environment detection.
//!
//! Single source of truth for the runtime environment, read from the
//! `ROADSIGN_ENV` environment variable:
//!
//! - `test` - skips the OS keyring, stores the token in a file
//! - `development` or `dev` - debug logging by default
//! - (anything else or unset) - production

/// Runtime environment for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - file-backed credential storage.
    Test,
}

impl Environment {
    /// Detect the current environment from `ROADSIGN_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("ROADSIGN_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` for the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Log filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production | Self::Test => "info",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Returns `true` if the OS keyring must be bypassed.
#[must_use]
pub fn should_skip_keyring() -> bool {
    Environment::current().is_test()
}
