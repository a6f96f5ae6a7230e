//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `CredentialManager`: keeps the upstream credential valid

mod credentials;

pub use credentials::{
    CredentialManager, CredentialSettings, CredentialStatus, MIN_CHECK_INTERVAL, RefreshError,
};
