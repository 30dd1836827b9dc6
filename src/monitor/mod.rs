//! Directory monitors and the shard I/O they share
//!
//! The combox monitor pushes local changes out to the node directories; one
//! node monitor per node directory pulls remote changes back in once every
//! node has reported them.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::codec;
use crate::config::Config;
use crate::error::{ComboxError, Result};
use crate::paths::{NameMatcher, PathMapper};
use crate::scheduler::Scheduler;
use crate::silo::Silo;

pub mod canonical;
pub mod node;

pub use canonical::ComboxDirMonitor;
pub use node::NodeDirMonitor;

/// Lock shared by every monitor around observe-decide-commit sections
pub type MonitorLock = Arc<Mutex<()>>;

pub fn new_monitor_lock() -> MonitorLock {
	Arc::new(Mutex::new(()))
}

/// Tunables and matchers derived from the configuration
#[derive(Debug, Clone)]
pub struct MonitorOptions {
	pub secret: Vec<u8>,
	pub temp_files: NameMatcher,
	pub agent_cache: NameMatcher,
	pub file_delete_delay: Duration,
	pub dir_delete_delay: Duration,
	pub dir_delete_retries: u32,
	pub settle_bytes_per_sec: u64,
}

impl MonitorOptions {
	/// Defaults with the given passphrase
	pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
		let mut config = Config::default();
		config.passphrase = String::from_utf8_lossy(&secret.into()).into_owned();
		Self::from_config(&config)
	}

	pub fn from_config(config: &Config) -> Result<Self> {
		Ok(MonitorOptions {
			secret: config.passphrase.as_bytes().to_vec(),
			temp_files: NameMatcher::new(&config.temp_patterns)?,
			agent_cache: NameMatcher::new(&config.agent_cache_patterns)?,
			file_delete_delay: config.file_delete_delay(),
			dir_delete_delay: config.dir_delete_delay(),
			dir_delete_retries: config.dir_delete_retries,
			settle_bytes_per_sec: config.settle_bytes_per_sec.max(1),
		})
	}

	/// One second per `settle_bytes_per_sec`, at least one second
	pub fn settle_delay(&self, size: u64) -> Duration {
		Duration::from_secs((size / self.settle_bytes_per_sec).max(1))
	}
}

type EditSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Marks a canonical file as being re-read after a local modification.
/// Cleared on drop.
pub struct LocalEdit {
	edits: EditSet,
	path: PathBuf,
}

impl Drop for LocalEdit {
	fn drop(&mut self) {
		self.edits.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.path);
	}
}

/// Handles injected into every monitor
#[derive(Clone)]
pub struct MonitorContext {
	pub mapper: PathMapper,
	pub silo: Arc<Silo>,
	pub lock: MonitorLock,
	pub scheduler: Arc<dyn Scheduler>,
	pub options: MonitorOptions,
	local_edits: EditSet,
}

impl MonitorContext {
	pub fn new(
		mapper: PathMapper,
		silo: Arc<Silo>,
		lock: MonitorLock,
		scheduler: Arc<dyn Scheduler>,
		options: MonitorOptions,
	) -> Self {
		MonitorContext { mapper, silo, lock, scheduler, options, local_edits: Arc::default() }
	}

	/// Local changes to `canonical` are waiting to be sharded. Node-side
	/// modifications of it must not be applied until the guard is dropped.
	pub fn begin_local_edit(&self, canonical: &Path) -> LocalEdit {
		self.local_edits.lock().unwrap_or_else(|e| e.into_inner()).insert(canonical.to_path_buf());
		LocalEdit { edits: self.local_edits.clone(), path: canonical.to_path_buf() }
	}

	pub fn has_local_edit(&self, canonical: &Path) -> bool {
		self.local_edits.lock().unwrap_or_else(|e| e.into_inner()).contains(canonical)
	}

	pub fn num_nodes(&self) -> usize {
		self.mapper.num_nodes()
	}

	pub fn lock(&self) -> MutexGuard<'_, ()> {
		self.lock.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Split, encrypt and write `data` as the shards of `canonical`
	pub fn write_shards(&self, canonical: &Path, data: &[u8]) -> Result<()> {
		let shards = self.mapper.shard_paths(canonical)?;
		let ciphers = codec::encode(data, shards.len(), &self.options.secret);
		for (path, cipher) in shards.iter().zip(ciphers) {
			if let Some(parent) = path.parent() {
				fs::create_dir_all(parent).map_err(|e| ComboxError::fs(parent, e))?;
			}
			fs::write(path, cipher).map_err(|e| ComboxError::fs(path, e))?;
		}
		Ok(())
	}

	/// Shard `canonical` from disk and return the hash of what was written
	pub fn shard_file(&self, canonical: &Path) -> Result<String> {
		let data = fs::read(canonical).map_err(|e| ComboxError::fs(canonical, e))?;
		self.write_shards(canonical, &data)?;
		Ok(codec::hash_bytes(&data))
	}

	/// Read every shard of `canonical` and decode the plaintext
	pub fn read_shards(&self, canonical: &Path) -> Result<Vec<u8>> {
		let shards = self.mapper.shard_paths(canonical)?;
		let mut ciphers = Vec::with_capacity(shards.len());
		for path in &shards {
			ciphers.push(fs::read(path).map_err(|e| ComboxError::fs(path, e))?);
		}
		Ok(codec::decode(&ciphers, shards.len(), &self.options.secret)?)
	}

	/// Number of nodes on which a shard of `canonical` exists
	pub fn count_shards(&self, canonical: &Path) -> Result<usize> {
		Ok(self.mapper.shard_paths(canonical)?.iter().filter(|p| p.is_file()).count())
	}

	/// True if the shard at `shard` is exactly what the current content of
	/// `canonical` encodes to
	pub fn shard_matches_canonical(&self, shard: &Path, canonical: &Path) -> bool {
		let idx = match crate::paths::shard_index(shard) {
			Some(idx) if idx < self.num_nodes() => idx,
			_ => return false,
		};
		let (data, on_disk) = match (fs::read(canonical), fs::read(shard)) {
			(Ok(d), Ok(s)) => (d, s),
			_ => return false,
		};
		let part = codec::split(&data, self.num_nodes()).swap_remove(idx);
		codec::encrypt(&part, &self.options.secret).as_bytes() == on_disk.as_slice()
	}

	pub fn remove_shards(&self, canonical: &Path) -> Result<()> {
		for path in self.mapper.shard_paths(canonical)? {
			remove_file_if_exists(&path)?;
		}
		Ok(())
	}

	pub fn move_shards(&self, from: &Path, to: &Path) -> Result<()> {
		let sources = self.mapper.shard_paths(from)?;
		let dests = self.mapper.shard_paths(to)?;
		for (src, dst) in sources.iter().zip(dests.iter()) {
			rename_if_exists(src, dst)?;
		}
		Ok(())
	}

	pub fn mk_nodedirs(&self, canonical: &Path) -> Result<()> {
		for path in self.mapper.dir_paths(canonical)? {
			fs::create_dir_all(&path).map_err(|e| ComboxError::fs(&path, e))?;
		}
		Ok(())
	}

	pub fn rm_nodedirs(&self, canonical: &Path) -> Result<()> {
		for path in self.mapper.dir_paths(canonical)? {
			remove_dir_all_if_exists(&path)?;
		}
		Ok(())
	}

	pub fn move_nodedirs(&self, from: &Path, to: &Path) -> Result<()> {
		let sources = self.mapper.dir_paths(from)?;
		let dests = self.mapper.dir_paths(to)?;
		for (src, dst) in sources.iter().zip(dests.iter()) {
			rename_if_exists(src, dst)?;
		}
		Ok(())
	}

	/// Canonical paths of every shard-shaped file under `node`
	pub fn scan_node(&self, node: usize) -> Vec<PathBuf> {
		let mut found = Vec::new();
		if let Some(root) = self.mapper.nodes().get(node) {
			walk_files(root, &mut |path| {
				if crate::paths::shard_index(path) == Some(node) {
					if let Ok(canonical) = self.mapper.to_canonical(path) {
						found.push(canonical);
					}
				}
			});
		}
		found
	}
}

pub(crate) fn remove_file_if_exists(path: &Path) -> Result<bool> {
	match fs::remove_file(path) {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			debug!("Already gone: {}", path.display());
			Ok(false)
		}
		Err(e) => Err(ComboxError::fs(path, e)),
	}
}

pub(crate) fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
	match fs::remove_dir_all(path) {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
		Err(e) => Err(ComboxError::fs(path, e)),
	}
}

pub(crate) fn rename_if_exists(from: &Path, to: &Path) -> Result<bool> {
	if !from.exists() {
		debug!("Nothing to rename at {}", from.display());
		return Ok(false);
	}
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).map_err(|e| ComboxError::fs(parent, e))?;
	}
	fs::rename(from, to).map_err(|e| ComboxError::fs(from, e))?;
	Ok(true)
}

/// Visit every regular file below `dir`; unreadable entries are skipped
pub(crate) fn walk_files(dir: &Path, visit: &mut dyn FnMut(&Path)) {
	walk(dir, &mut |path, is_dir| {
		if !is_dir {
			visit(path)
		}
	});
}

/// Visit every file and directory below `dir`, parents before children
pub(crate) fn walk(dir: &Path, visit: &mut dyn FnMut(&Path, bool)) {
	let entries = match fs::read_dir(dir) {
		Ok(e) => e,
		Err(e) => {
			debug!("Cannot read directory {}: {}", dir.display(), e);
			return;
		}
	};
	for entry in entries.flatten() {
		let path = entry.path();
		let meta = match fs::symlink_metadata(&path) {
			Ok(m) => m,
			Err(_) => continue,
		};
		if meta.is_dir() {
			visit(&path, true);
			walk(&path, visit);
		} else if meta.is_file() {
			visit(&path, false);
		}
	}
}


// vim: ts=4
