//! Shard codec: byte-level split/glue and per-shard encryption
//!
//! A tracked file is cut into `n` contiguous parts, one per node. Each part is
//! padded, encrypted with AES-256 in ECB mode under a key derived from the
//! passphrase, and base64 encoded. This is the legacy placeholder scheme and
//! has not been audited.
//!
//! Padding uses a sentinel byte that is stripped from the tail on decrypt, so a
//! part whose plaintext ends in [`PAD_CHAR`] loses those trailing bytes. The
//! round trip is exact for every other input.
//! TODO: switch to a length-prefixed padding once existing shards can be migrated.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fs;
use std::path::Path;

use crate::error::{ComboxError, CryptoError, Result};

/// Padding granularity for both data and key
pub const BLOCK_SIZE: usize = 32;

/// Sentinel byte used for padding
pub const PAD_CHAR: u8 = b'#';

/// AES block length
const AES_BLOCK: usize = 16;

/// Split `data` into `n` contiguous parts of `len / n` bytes; the last part
/// also takes the remainder. `n == 0` is treated as 1.
pub fn split(data: &[u8], n: usize) -> Vec<Vec<u8>> {
	let n = n.max(1);
	let part_size = data.len() / n;

	let mut parts = Vec::with_capacity(n);
	for i in 0..n {
		let start = i * part_size;
		let end = if i == n - 1 { data.len() } else { start + part_size };
		parts.push(data[start..end].to_vec());
	}
	parts
}

/// Concatenate parts in order
pub fn glue<P: AsRef<[u8]>>(parts: &[P]) -> Vec<u8> {
	let total = parts.iter().map(|p| p.as_ref().len()).sum();
	let mut data = Vec::with_capacity(total);
	for part in parts {
		data.extend_from_slice(part.as_ref());
	}
	data
}

/// Pad to the next multiple of BLOCK_SIZE. Input that is already aligned
/// still gets a full block of padding.
fn pad(data: &[u8]) -> Vec<u8> {
	let padding = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
	let mut padded = Vec::with_capacity(data.len() + padding);
	padded.extend_from_slice(data);
	padded.resize(data.len() + padding, PAD_CHAR);
	padded
}

/// Derive the 256-bit cipher key: the padded secret, folded onto 32 bytes
fn cipher(secret: &[u8]) -> Aes256 {
	let padded = pad(secret);
	let mut key = [0u8; BLOCK_SIZE];
	key.copy_from_slice(&padded[..BLOCK_SIZE]);
	for block in padded[BLOCK_SIZE..].chunks(BLOCK_SIZE) {
		for (k, b) in key.iter_mut().zip(block) {
			*k ^= b;
		}
	}
	Aes256::new(GenericArray::from_slice(&key))
}

/// Encrypt bytes and return base64 text
pub fn encrypt(data: &[u8], secret: &[u8]) -> String {
	let aes = cipher(secret);
	let mut buf = pad(data);
	for block in buf.chunks_exact_mut(AES_BLOCK) {
		aes.encrypt_block(GenericArray::from_mut_slice(block));
	}
	STANDARD.encode(&buf)
}

/// Decrypt base64 text and strip the trailing pad bytes
pub fn decrypt(cipher_text: &[u8], secret: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
	let text: Vec<u8> =
		cipher_text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
	let mut buf = STANDARD
		.decode(&text)
		.map_err(|e| CryptoError::InvalidEncoding { message: e.to_string() })?;
	if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
		return Err(CryptoError::InvalidLength { len: buf.len() });
	}

	let aes = cipher(secret);
	for block in buf.chunks_exact_mut(AES_BLOCK) {
		aes.decrypt_block(GenericArray::from_mut_slice(block));
	}

	let end = buf.iter().rposition(|&b| b != PAD_CHAR).map(|i| i + 1).unwrap_or(0);
	buf.truncate(end);
	Ok(buf)
}

pub fn encrypt_shards<P: AsRef<[u8]>>(shards: &[P], secret: &[u8]) -> Vec<String> {
	shards.iter().map(|s| encrypt(s.as_ref(), secret)).collect()
}

pub fn decrypt_shards<P: AsRef<[u8]>>(
	ciphers: &[P],
	secret: &[u8],
) -> std::result::Result<Vec<Vec<u8>>, CryptoError> {
	ciphers.iter().map(|c| decrypt(c.as_ref(), secret)).collect()
}

/// Split and encrypt in one go, producing one shard text per node
pub fn encode(data: &[u8], n: usize, secret: &[u8]) -> Vec<String> {
	encrypt_shards(&split(data, n), secret)
}

/// Decrypt and glue shard texts, which must be in node order
pub fn decode<P: AsRef<[u8]>>(
	ciphers: &[P],
	n: usize,
	secret: &[u8],
) -> std::result::Result<Vec<u8>, CryptoError> {
	if ciphers.len() != n {
		return Err(CryptoError::ShardCount { expected: n, actual: ciphers.len() });
	}
	Ok(glue(&decrypt_shards(ciphers, secret)?))
}

/// Content digest stored in the silo
pub fn hash_bytes(data: &[u8]) -> String {
	hex::encode(blake3::hash(data).as_bytes())
}

pub fn hash_file(path: &Path) -> Result<String> {
	let data = fs::read(path).map_err(|e| ComboxError::fs(path, e))?;
	Ok(hash_bytes(&data))
}


// vim: ts=4
