use parcel_types::HashAlgorithm;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Computes the digest of `data` and returns it hex-encoded (lowercase).
pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        HashAlgorithm::Sha384 => hex::encode(Sha384::digest(data)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
    }
}

/// Recomputes the digest of `data` and compares it with `expected`.
///
/// Returns the recomputed digest on success, `Err(actual)` on mismatch.
/// Comparison is case-insensitive since clients differ in hex casing.
pub fn verify_digest(algorithm: HashAlgorithm, data: &[u8], expected: &str) -> Result<String, String> {
    let actual = digest_hex(algorithm, data);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(actual)
    } else {
        Err(actual)
    }
}
