//! Plugin signature validation
//!
//! A plugin binary at `P` is signed by a detached file at `P.asc`. The
//! trust level decides what a failed validation means: `Required` refuses
//! the load, `Warn` loads anyway with the record marked unsigned, and
//! `Disabled` skips the check entirely.

use mittari_core::ControlError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Suffix appended to a plugin path to find its detached signature.
pub const SIGNATURE_SUFFIX: &str = ".asc";

/// How strictly plugin signatures are enforced at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    /// No signature check
    #[default]
    Disabled,
    /// Unsigned or badly signed plugins fail to load
    Required,
    /// Bad signatures are logged; the load proceeds with `signed = false`
    Warn,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLevel::Disabled => f.write_str("disabled"),
            TrustLevel::Required => f.write_str("required"),
            TrustLevel::Warn => f.write_str("warn"),
        }
    }
}

/// Validates a plugin binary against its detached signature and a keyring.
///
/// The control plane treats the validator as opaque: it either accepts or
/// returns a [`ControlError::SignatureInvalid`] explaining why.
pub trait SignatureValidator: Send + Sync {
    /// Validate `signed_file` against `signature_file` using `keyring_file`.
    fn validate(
        &self,
        keyring_file: &Path,
        signed_file: &Path,
        signature_file: &Path,
    ) -> Result<(), ControlError>;
}

/// Digest-based validator.
///
/// The signature file holds the hex SHA-256 of the binary; the keyring file
/// lists trusted digests, one per line (blank lines and `#` comments
/// ignored). A binary validates when its digest matches the signature file
/// and appears in the keyring.
#[derive(Debug, Default)]
pub struct ChecksumValidator;

impl ChecksumValidator {
    fn invalid(path: &Path, reason: impl Into<String>) -> ControlError {
        ControlError::SignatureInvalid {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn digest_of(path: &Path) -> Result<String, ControlError> {
        let contents = std::fs::read(path)
            .map_err(|e| Self::invalid(path, format!("cannot read file: {e}")))?;
        let digest = Sha256::digest(&contents);
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Ok(hex)
    }
}

impl SignatureValidator for ChecksumValidator {
    fn validate(
        &self,
        keyring_file: &Path,
        signed_file: &Path,
        signature_file: &Path,
    ) -> Result<(), ControlError> {
        let actual = Self::digest_of(signed_file)?;

        let claimed = std::fs::read_to_string(signature_file)
            .map_err(|e| Self::invalid(signed_file, format!("cannot read signature: {e}")))?;
        let claimed = claimed.trim();
        if !claimed.eq_ignore_ascii_case(&actual) {
            return Err(Self::invalid(signed_file, "signature does not match binary"));
        }

        let keyring = std::fs::read_to_string(keyring_file)
            .map_err(|e| Self::invalid(signed_file, format!("cannot read keyring: {e}")))?;
        let trusted = keyring
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .any(|line| line.eq_ignore_ascii_case(&actual));
        if !trusted {
            return Err(Self::invalid(signed_file, "digest not present in keyring"));
        }

        Ok(())
    }
}
