//! Secret handling utilities.
//!
//! Re-exports secrecy types for collaborator adapters and the binary.

pub use secrecy::{ExposeSecret, SecretString};

/// Read an optional secret; unset and empty both mean absent.
pub fn optional_secret(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

/// A second handle on `secret`, for handing one credential to several clients.
pub fn share(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
