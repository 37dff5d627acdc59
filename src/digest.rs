//! Content digests identifying exact byte content.
//!
//! A digest serves two roles here: it addresses the packaged context on the
//! staging server (so re-uploads of identical content land on the same
//! path), and it is the identity input handed to the tagging policy.

use std::fmt;

use crate::error::ResolveError;

/// A content digest: an algorithm name plus its hex-encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// A sha256 digest from an already hex-encoded value.
    pub fn sha256(encoded: impl Into<String>) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: encoded.into(),
        }
    }

    /// Parse a digest of the form `algorithm:encoded`, as registries
    /// report them.
    pub fn parse(value: &str) -> Result<Self, ResolveError> {
        let malformed = || ResolveError::MalformedDigest {
            value: value.to_string(),
        };

        let (algorithm, encoded) = value.split_once(':').ok_or_else(malformed)?;
        if algorithm.is_empty()
            || encoded.is_empty()
            || !encoded.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(malformed());
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// File name under which a context archive with this digest is staged,
    /// e.g. `sha256-deadbeef.tar.gz`.
    pub fn archive_file_name(&self) -> String {
        format!("{}-{}.tar.gz", self.algorithm, self.encoded)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        let digest = Digest::parse("sha256:abc123").unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.encoded(), "abc123");
        assert_eq!(digest.to_string(), "sha256:abc123");
    }

    #[test]
    fn test_archive_file_name() {
        let digest = Digest::sha256("deadbeef");
        assert_eq!(digest.archive_file_name(), "sha256-deadbeef.tar.gz");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse(":abc").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("sha256:not-hex!").is_err());
    }

    #[test]
    fn test_sha256_constructor() {
        let digest = Digest::sha256("00ff");
        assert_eq!(digest, Digest::parse("sha256:00ff").unwrap());
    }
}
