//! Error types for combox operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Main error type for reconciliation operations
#[derive(Debug)]
pub enum ComboxError {
	/// Path is not rooted under the combox directory or any node directory
	InvalidPath { path: PathBuf, message: String },

	/// rename/remove/mkdir/read/write failed on a node or canonical path
	Filesystem { path: PathBuf, source: io::Error },

	/// Silo error (nested)
	Metadata(SiloError),

	/// Shard codec error (nested)
	Crypto(CryptoError),

	/// Invalid configuration
	Config { message: String },

	/// Filesystem notification setup failed
	Watch { path: PathBuf, message: String },
}

impl ComboxError {
	/// Wrap an io::Error with the path it happened on
	pub fn fs(path: &Path, source: io::Error) -> Self {
		ComboxError::Filesystem { path: path.to_path_buf(), source }
	}

	pub fn invalid_path(path: &Path, message: impl Into<String>) -> Self {
		ComboxError::InvalidPath { path: path.to_path_buf(), message: message.into() }
	}

	pub fn config(message: impl Into<String>) -> Self {
		ComboxError::Config { message: message.into() }
	}

	/// True if the underlying failure is a missing file or directory
	pub fn is_not_found(&self) -> bool {
		matches!(self, ComboxError::Filesystem { source, .. } if source.kind() == io::ErrorKind::NotFound)
	}
}

impl fmt::Display for ComboxError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ComboxError::InvalidPath { path, message } => {
				write!(f, "Invalid path {}: {}", path.display(), message)
			}
			ComboxError::Filesystem { path, source } => {
				write!(f, "Filesystem error on {}: {}", path.display(), source)
			}
			ComboxError::Metadata(e) => write!(f, "Silo error: {}", e),
			ComboxError::Crypto(e) => write!(f, "Crypto error: {}", e),
			ComboxError::Config { message } => write!(f, "Invalid configuration: {}", message),
			ComboxError::Watch { path, message } => {
				write!(f, "Cannot watch {}: {}", path.display(), message)
			}
		}
	}
}

impl Error for ComboxError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ComboxError::Filesystem { source, .. } => Some(source),
			ComboxError::Metadata(e) => Some(e),
			ComboxError::Crypto(e) => Some(e),
			_ => None,
		}
	}
}

impl From<SiloError> for ComboxError {
	fn from(e: SiloError) -> Self {
		ComboxError::Metadata(e)
	}
}

impl From<CryptoError> for ComboxError {
	fn from(e: CryptoError) -> Self {
		ComboxError::Crypto(e)
	}
}

/// Metadata store errors
#[derive(Debug)]
pub enum SiloError {
	/// Failed to open or create the database file
	OpenFailed { path: PathBuf, source: Box<dyn Error + Send + Sync> },

	/// A transaction could not be started, read or committed
	Transaction { source: Box<dyn Error + Send + Sync> },

	/// A stored value could not be decoded
	Corrupted { key: String, message: String },
}

impl fmt::Display for SiloError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SiloError::OpenFailed { path, source } => {
				write!(f, "Failed to open silo {}: {}", path.display(), source)
			}
			SiloError::Transaction { source } => write!(f, "Silo transaction failed: {}", source),
			SiloError::Corrupted { key, message } => {
				write!(f, "Silo entry {} corrupted: {}", key, message)
			}
		}
	}
}

impl Error for SiloError {}

macro_rules! silo_txn_error {
	($($t:ty),*) => {
		$(
			impl From<$t> for SiloError {
				fn from(e: $t) -> Self {
					SiloError::Transaction { source: Box::new(e) }
				}
			}
		)*
	};
}

silo_txn_error!(
	redb::TransactionError,
	redb::TableError,
	redb::StorageError,
	redb::CommitError
);

/// Shard codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
	/// Shard text is not valid base64
	InvalidEncoding { message: String },

	/// Decoded ciphertext is not a whole number of cipher blocks
	InvalidLength { len: usize },

	/// Wrong number of shards handed to the decoder
	ShardCount { expected: usize, actual: usize },
}

impl fmt::Display for CryptoError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CryptoError::InvalidEncoding { message } => {
				write!(f, "Malformed shard encoding: {}", message)
			}
			CryptoError::InvalidLength { len } => {
				write!(f, "Ciphertext length {} is not a multiple of the block size", len)
			}
			CryptoError::ShardCount { expected, actual } => {
				write!(f, "Expected {} shards, got {}", expected, actual)
			}
		}
	}
}

impl Error for CryptoError {}

pub type Result<T> = std::result::Result<T, ComboxError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_filesystem_error_display() {
		let err = ComboxError::fs(
			Path::new("/tmp/node0/a.txt.shard0"),
			io::Error::new(io::ErrorKind::NotFound, "gone"),
		);
		let msg = err.to_string();
		assert!(msg.contains("a.txt.shard0"));
		assert!(msg.contains("gone"));
		assert!(err.is_not_found());
	}

	#[test]
	fn test_nested_conversions() {
		let err: ComboxError = CryptoError::InvalidLength { len: 7 }.into();
		assert!(matches!(err, ComboxError::Crypto(_)));
		assert!(err.to_string().contains("7"));

		let err: ComboxError =
			SiloError::Corrupted { key: "a".to_string(), message: "bad".to_string() }.into();
		assert!(matches!(err, ComboxError::Metadata(_)));
		assert!(!err.is_not_found());
	}
}

// vim: ts=4
