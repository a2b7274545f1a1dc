//! Error types for Postgrid

use thiserror::Error;

use crate::types::PostResponse;

pub type Result<T> = std::result::Result<T, PostgridError>;

#[derive(Error, Debug)]
pub enum PostgridError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("SSO error: {0}")]
    Sso(#[from] SsoError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PostgridError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PostgridError::InvalidInput(_) => 3,
            PostgridError::Provider(e) if e.requires_reauthentication() => 2,
            PostgridError::Sso(e) if e.is_authentication_failure() => 2,
            PostgridError::Provider(_) => 1,
            PostgridError::Sso(_) => 1,
            PostgridError::Config(_) => 1,
            PostgridError::Database(_) => 1,
        }
    }

    /// The provider error wrapped by this error, if any
    pub fn as_provider(&self) -> Option<&ProviderError> {
        match self {
            PostgridError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },
}

/// Failures raised by social network adapters
///
/// Cloneable so the publishing service can keep the last error across
/// retry attempts.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The vendor rejected the request; `message` is the classified,
    /// user-facing explanation when one is known.
    #[error("{identifier} rejected the request: {}", display_or(.message, .body))]
    BadBody {
        identifier: String,
        message: String,
        body: String,
        request: String,
    },

    /// The stored token is no longer accepted and must be refreshed or the
    /// account reconnected.
    #[error("{identifier} requires a token refresh: {}", display_or(.message, .body))]
    RefreshToken {
        identifier: String,
        message: String,
        body: String,
    },

    #[error("Missing required scopes: {}", .0.join(", "))]
    NotEnoughScopes(Vec<String>),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("{identifier} job did not finish after {attempts} status checks")]
    PollTimeout { identifier: String, attempts: u32 },

    #[error("{identifier} job failed: {message}")]
    JobFailed { identifier: String, message: String },

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// A chain failed part way; `published` items are already live and
    /// must not be sent again.
    #[error("{source} ({} item(s) already published)", .published.len())]
    Partial {
        published: Vec<PostResponse>,
        source: Box<ProviderError>,
    },
}

fn display_or<'a>(message: &'a str, body: &'a str) -> &'a str {
    if message.is_empty() {
        body
    } else {
        message
    }
}

impl ProviderError {
    /// Whether the user has to re-authenticate before the call can succeed
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self.root(),
            ProviderError::RefreshToken { .. }
                | ProviderError::InvalidCredentials(_)
                | ProviderError::NotEnoughScopes(_)
        )
    }

    /// Whether retrying the same call later may succeed
    ///
    /// A partly published chain is never transient: replaying it would post
    /// the published items twice.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Network(_) | ProviderError::RateLimit(_))
    }

    /// The failure itself, looking through [`ProviderError::Partial`]
    pub fn root(&self) -> &ProviderError {
        match self {
            ProviderError::Partial { source, .. } => source.root(),
            other => other,
        }
    }

    /// Items already published before the failure
    pub fn published(&self) -> &[PostResponse] {
        match self {
            ProviderError::Partial { published, .. } => published,
            _ => &[],
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.status().map(|s| s.as_u16()) == Some(429) {
            return ProviderError::RateLimit(error.to_string());
        }
        if error.is_decode() {
            return ProviderError::Posting(format!("Unexpected response body: {}", error));
        }
        ProviderError::Network(error.to_string())
    }
}

impl From<reqwest::Error> for PostgridError {
    fn from(error: reqwest::Error) -> Self {
        PostgridError::Provider(error.into())
    }
}

#[derive(Error, Debug, Clone)]
pub enum SsoError {
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Product is inactive: {0}")]
    ProductInactive(String),

    #[error("Product slug already registered: {0}")]
    DuplicateSlug(String),

    #[error("Invalid request signature")]
    InvalidSignature,

    #[error("Request timestamp outside the accepted window ({skew_secs}s skew)")]
    ExpiredRequest { skew_secs: i64 },

    #[error("Invalid session token: {0}")]
    InvalidToken(String),

    #[error("Redirect URI not allowed for product: {0}")]
    InvalidRedirect(String),

    #[error("Login code not found or already used")]
    CodeNotFound,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
}

impl SsoError {
    /// Whether the error stems from rejected credentials rather than bad data
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            SsoError::InvalidSignature
                | SsoError::ExpiredRequest { .. }
                | SsoError::InvalidToken(_)
                | SsoError::CodeNotFound
                | SsoError::ProductInactive(_)
        )
    }
}
