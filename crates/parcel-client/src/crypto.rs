use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parcel_transfer::{TransferError, chunk_stream};
use sha2::{Digest, Sha256};

/// Plaintext bytes per cipher record.
pub const RECORD_SIZE: usize = 64 * 1024;

/// AES-GCM authentication tag appended to every record.
pub const TAG_SIZE: usize = 16;

/// Record-oriented payload transform.
///
/// Plaintext is cut into records of [`record_size`](Self::record_size) bytes
/// (the last may be shorter); each record grows by exactly
/// [`overhead`](Self::overhead) bytes when encrypted.
pub trait PayloadCipher: Send + Sync {
    fn record_size(&self) -> usize;

    fn overhead(&self) -> usize;

    fn encrypt_record(&self, index: u64, plaintext: &[u8]) -> Result<Bytes, TransferError>;

    fn decrypt_record(&self, index: u64, ciphertext: &[u8]) -> Result<Bytes, TransferError>;

    /// Ciphertext length for `plaintext_len` bytes of input.
    fn encrypted_len(&self, plaintext_len: u64) -> u64 {
        let records = plaintext_len.div_ceil(self.record_size() as u64);
        plaintext_len + records * self.overhead() as u64
    }
}

/// Derive an encryption key from a master key and salt using SHA-256.
pub fn derive_key(master_key: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master_key);
    hasher.update(salt);
    hasher.finalize().into()
}

/// Nonce for record `index`: SHA-256(key || index_le)[..12].
///
/// Unique per (key, index), so a fresh salt per upload never repeats a nonce.
pub fn derive_record_nonce(key: &[u8; 32], index: u64) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

/// AES-256-GCM with derived nonces. Records carry no nonce on the wire,
/// only the 16-byte tag.
pub struct AesGcmCipher {
    key: [u8; 32],
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(master_key: &[u8], salt: &[u8]) -> Self {
        Self::from_key(derive_key(master_key, salt))
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
            key,
        }
    }
}

impl PayloadCipher for AesGcmCipher {
    fn record_size(&self) -> usize {
        RECORD_SIZE
    }

    fn overhead(&self) -> usize {
        TAG_SIZE
    }

    fn encrypt_record(&self, index: u64, plaintext: &[u8]) -> Result<Bytes, TransferError> {
        let nonce = derive_record_nonce(&self.key, index);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map(Bytes::from)
            .map_err(|e| TransferError::Internal(format!("encryption failed on record {}: {}", index, e)))
    }

    fn decrypt_record(&self, index: u64, ciphertext: &[u8]) -> Result<Bytes, TransferError> {
        if ciphertext.len() <= TAG_SIZE {
            return Err(TransferError::Integrity(format!("record {} too short", index)));
        }
        let nonce = derive_record_nonce(&self.key, index);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map(Bytes::from)
            .map_err(|_| TransferError::Integrity(format!("record {} failed authentication", index)))
    }
}

/// Encrypts a plaintext stream record by record.
pub fn encrypt_stream<S>(
    cipher: Arc<dyn PayloadCipher>,
    source: S,
) -> impl Stream<Item = Result<Bytes, TransferError>> + Send
where
    S: Stream<Item = Result<Bytes, TransferError>> + Send,
{
    let record_size = cipher.record_size();
    chunk_stream(source, record_size).map(move |record| {
        let record = record?;
        cipher.encrypt_record(record.index as u64, &record.data)
    })
}

/// Decrypts a ciphertext stream produced by [`encrypt_stream`].
pub fn decrypt_stream<S>(
    cipher: Arc<dyn PayloadCipher>,
    source: S,
) -> impl Stream<Item = Result<Bytes, TransferError>> + Send
where
    S: Stream<Item = Result<Bytes, TransferError>> + Send,
{
    let record_size = cipher.record_size() + cipher.overhead();
    chunk_stream(source, record_size).map(move |record| {
        let record = record?;
        cipher.decrypt_record(record.index as u64, &record.data)
    })
}

/// Decrypts a whole ciphertext held in memory.
pub fn decrypt_all(cipher: &dyn PayloadCipher, ciphertext: &[u8]) -> Result<Vec<u8>, TransferError> {
    if ciphertext.is_empty() {
        return Err(TransferError::EmptyUpload);
    }
    let record_size = cipher.record_size() + cipher.overhead();
    let mut plaintext = Vec::with_capacity(ciphertext.len());
    for (index, record) in ciphertext.chunks(record_size).enumerate() {
        plaintext.extend_from_slice(&cipher.decrypt_record(index as u64, record)?);
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{TryStreamExt, stream};

    fn cipher() -> Arc<dyn PayloadCipher> {
        Arc::new(AesGcmCipher::new(b"master key", b"salt"))
    }

    #[test]
    fn record_roundtrip_and_tamper_detection() {
        let c = cipher();
        let sealed = c.encrypt_record(3, b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_SIZE);
        assert_eq!(&c.decrypt_record(3, &sealed).unwrap()[..], b"hello");

        // wrong index means wrong nonce
        assert!(matches!(c.decrypt_record(4, &sealed), Err(TransferError::Integrity(_))));

        let mut flipped = sealed.to_vec();
        flipped[0] ^= 1;
        assert!(matches!(c.decrypt_record(3, &flipped), Err(TransferError::Integrity(_))));
    }

    #[test]
    fn nonces_differ_per_record() {
        let key = derive_key(b"k", b"s");
        assert_ne!(derive_record_nonce(&key, 0), derive_record_nonce(&key, 1));
        assert_eq!(derive_record_nonce(&key, 7), derive_record_nonce(&key, 7));
    }

    #[tokio::test]
    async fn streams_survive_arbitrary_buffer_boundaries() {
        let c = cipher();
        let plaintext: Vec<u8> = (0..RECORD_SIZE * 2 + 100).map(|i| (i % 13) as u8).collect();
        let parts: Vec<Result<Bytes, TransferError>> = plaintext
            .chunks(10_000)
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();

        let sealed: Vec<Bytes> = encrypt_stream(c.clone(), stream::iter(parts)).try_collect().await.unwrap();
        let total: usize = sealed.iter().map(Bytes::len).sum();
        assert_eq!(total as u64, c.encrypted_len(plaintext.len() as u64));

        // re-split the ciphertext at odd offsets
        let joined: Vec<u8> = sealed.concat();
        let parts: Vec<Result<Bytes, TransferError>> = joined
            .chunks(7_777)
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        let opened: Vec<Bytes> = decrypt_stream(c.clone(), stream::iter(parts)).try_collect().await.unwrap();
        assert_eq!(opened.concat(), plaintext);

        assert_eq!(decrypt_all(c.as_ref(), &joined).unwrap(), plaintext);
    }
}
