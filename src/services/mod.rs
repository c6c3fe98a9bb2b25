pub mod credentials;
pub mod rate_limit;

pub use credentials::{CredentialError, CredentialStore, SECRET_FIELDS};
pub use rate_limit::RateLimiter;
