//! Parcel client: encrypts files record by record, uploads the ciphertext
//! in parallel integrity-checked chunks and streams it back down.

pub mod crypto;
pub mod download;
pub mod scheduler;
pub mod transport;

pub use crypto::{AesGcmCipher, PayloadCipher};
pub use download::{DownloadController, DownloadOutcome, DownloadRequest, DownloadStrategy, spawn_agent};
pub use parcel_transfer::{RetryPolicy, TransferError};
pub use scheduler::{UploadEvent, UploadOptions, UploadScheduler};
pub use transport::{BlobFetcher, HttpTransport, Transport};
