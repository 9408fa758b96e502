use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Digest algorithm used for per-chunk integrity checks.
///
/// Wire names follow the Web Crypto spelling (`SHA-256`), which is what
/// browser clients send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA-1")]
    Sha1,
    #[default]
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-384")]
    Sha384,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    /// Accepts `SHA-256`, `sha256`, `sha-256` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "");
        match normalized.as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(format!("unsupported hash algorithm: {}", s)),
        }
    }
}

/// Per-session integrity settings chosen by the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default = "default_verification")]
    pub enable_verification: bool,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

fn default_verification() -> bool {
    true
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_verification: true,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

/// Machine-readable error codes carried in error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Integrity,
    NotFound,
    IncompleteUpload,
    MissingChunk,
    EmptyUpload,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_algorithm_parses_loose_spellings() {
        assert_eq!("SHA-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("sha-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn security_config_defaults_to_verified_sha256() {
        let cfg: SecurityConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.enable_verification);
        assert_eq!(cfg.hash_algorithm, HashAlgorithm::Sha256);

        let cfg: SecurityConfig =
            serde_json::from_str(r#"{"enableVerification":false,"hashAlgorithm":"SHA-1"}"#).unwrap();
        assert!(!cfg.enable_verification);
        assert_eq!(cfg.hash_algorithm, HashAlgorithm::Sha1);
    }
}
