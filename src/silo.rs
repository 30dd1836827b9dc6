//! The silo: persistent record of tracked files and quorum counters
//!
//! Backed by a single redb database under the metadata directory. Every call
//! runs in its own transaction, so each read observes the latest committed
//! state written by any monitor thread. Calls are additionally serialized by a
//! store lock; sequences of calls that must appear atomic need the caller's
//! monitor lock on top of that.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::codec;
use crate::error::{Result, SiloError};

/// Key: silo key (combox-relative path)
/// Value: hex content hash
const FILES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("files");

/// Key: silo key
/// Value: serialized CounterEntry
const CREATED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_created");
const MODIFIED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_modified");
const DELETED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_deleted");
const MOVED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_moved");

/// Which transition a quorum counter is tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
	Created,
	Modified,
	Deleted,
	Moved,
}

impl CounterKind {
	pub const ALL: [CounterKind; 4] =
		[CounterKind::Created, CounterKind::Modified, CounterKind::Deleted, CounterKind::Moved];

	fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
		match self {
			CounterKind::Created => CREATED_TABLE,
			CounterKind::Modified => MODIFIED_TABLE,
			CounterKind::Deleted => DELETED_TABLE,
			CounterKind::Moved => MOVED_TABLE,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			CounterKind::Created => "created",
			CounterKind::Modified => "modified",
			CounterKind::Deleted => "deleted",
			CounterKind::Moved => "moved",
		}
	}
}

impl fmt::Display for CounterKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// A quorum counter; `dest` is only set for moves. `nodes` holds the node
/// indices that reported the transition, so a node is counted once however
/// many events it delivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
	#[serde(rename = "n")]
	pub count: u32,
	#[serde(rename = "to", default, skip_serializing_if = "Option::is_none")]
	pub dest: Option<String>,
	#[serde(rename = "by", default, skip_serializing_if = "Vec::is_empty")]
	pub nodes: Vec<usize>,
}

impl CounterEntry {
	/// Add `node` to the reporters; returns false if it was already there
	fn report(&mut self, node: usize) -> bool {
		if self.nodes.contains(&node) {
			return false;
		}
		self.nodes.push(node);
		self.nodes.sort_unstable();
		self.count += 1;
		true
	}
}

enum CounterUpdate<'a> {
	/// Anonymous increment, or overwrite with an explicit value
	Step(Option<u32>),
	/// One node's observation, optionally with a move destination
	Report { node: usize, dest: Option<&'a str> },
	/// Replace the reporter set
	Reporters(&'a [usize]),
}

fn decode_entry(key: &str, bytes: &[u8]) -> std::result::Result<CounterEntry, SiloError> {
	let text = std::str::from_utf8(bytes)
		.map_err(|e| SiloError::Corrupted { key: key.to_string(), message: e.to_string() })?;
	json5::from_str(text)
		.map_err(|e| SiloError::Corrupted { key: key.to_string(), message: e.to_string() })
}

fn encode_entry(key: &str, entry: &CounterEntry) -> std::result::Result<Vec<u8>, SiloError> {
	json5::to_string(entry)
		.map(String::into_bytes)
		.map_err(|e| SiloError::Corrupted { key: key.to_string(), message: e.to_string() })
}

/// Metadata store shared by all monitors
pub struct Silo {
	db: redb::Database,
	path: PathBuf,
	store_lock: Mutex<()>,
}

impl Silo {
	/// Open or create the silo database
	pub fn open(db_path: &Path) -> std::result::Result<Self, SiloError> {
		let db = redb::Database::create(db_path)
			.map_err(|e| SiloError::OpenFailed { path: db_path.to_path_buf(), source: Box::new(e) })?;
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(FILES_TABLE)?;
			for kind in CounterKind::ALL.iter() {
				let _ = write_txn.open_table(kind.table())?;
			}
			write_txn.commit()?;
		}
		Ok(Silo { db, path: db_path.to_path_buf(), store_lock: Mutex::new(()) })
	}

	/// Open `silo.redb` inside the metadata directory
	pub fn open_in(metadata_dir: &Path) -> std::result::Result<Self, SiloError> {
		Self::open(&metadata_dir.join("silo.redb"))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn lock(&self) -> MutexGuard<'_, ()> {
		self.store_lock.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Record or overwrite the hash of `key`
	pub fn put(&self, key: &str, hash: &str) -> std::result::Result<(), SiloError> {
		let _guard = self.lock();
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(FILES_TABLE)?;
			table.insert(key, hash)?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn get(&self, key: &str) -> std::result::Result<Option<String>, SiloError> {
		let _guard = self.lock();
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(FILES_TABLE)?;
		let hash = table.get(key)?.map(|v| v.value().to_string());
		Ok(hash)
	}

	pub fn contains(&self, key: &str) -> std::result::Result<bool, SiloError> {
		Ok(self.get(key)?.is_some())
	}

	/// Remove the record; returns false if there was none
	pub fn remove(&self, key: &str) -> std::result::Result<bool, SiloError> {
		let _guard = self.lock();
		let write_txn = self.db.begin_write()?;
		let removed = {
			let mut table = write_txn.open_table(FILES_TABLE)?;
			let removed = table.remove(key)?.is_some();
			removed
		};
		write_txn.commit()?;
		Ok(removed)
	}

	/// `Some(true)` if `hash` differs from the stored one, `Some(false)` if it
	/// is equal, `None` if `key` is not tracked
	pub fn is_stale(&self, key: &str, hash: &str) -> std::result::Result<Option<bool>, SiloError> {
		Ok(self.get(key)?.map(|stored| stored != hash))
	}

	/// Like [`Silo::is_stale`], hashing the file at `path`
	pub fn is_stale_file(&self, key: &str, path: &Path) -> Result<Option<bool>> {
		let hash = codec::hash_file(path)?;
		Ok(self.is_stale(key, &hash)?)
	}

	/// Snapshot of every tracked key
	pub fn keys(&self) -> std::result::Result<Vec<String>, SiloError> {
		Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
	}

	/// Snapshot of every (key, hash) pair
	pub fn entries(&self) -> std::result::Result<Vec<(String, String)>, SiloError> {
		let _guard = self.lock();
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(FILES_TABLE)?;
		let mut entries = Vec::new();
		for item in table.iter()? {
			let (k, v) = item?;
			entries.push((k.value().to_string(), v.value().to_string()));
		}
		Ok(entries)
	}

	/// Move the record of `from` to `to`, keeping its hash
	pub fn rename(&self, from: &str, to: &str) -> std::result::Result<bool, SiloError> {
		let _guard = self.lock();
		let write_txn = self.db.begin_write()?;
		let moved = {
			let mut table = write_txn.open_table(FILES_TABLE)?;
			let hash = table.remove(from)?.map(|v| v.value().to_string());
			match hash {
				Some(hash) => {
					table.insert(to, hash.as_str())?;
					true
				}
				None => false,
			}
		};
		write_txn.commit()?;
		Ok(moved)
	}

	/// Rewrite every key under directory `from` to live under `to`
	pub fn rename_prefix(&self, from: &str, to: &str) -> std::result::Result<usize, SiloError> {
		let _guard = self.lock();
		let prefix = format!("{}/", from);
		let write_txn = self.db.begin_write()?;
		let count = {
			let mut table = write_txn.open_table(FILES_TABLE)?;
			let mut matched = Vec::new();
			for item in table.iter()? {
				let (k, v) = item?;
				let key = k.value();
				if let Some(rest) = key.strip_prefix(&prefix) {
					matched.push((key.to_string(), format!("{}/{}", to, rest), v.value().to_string()));
				}
			}
			for (old, new, hash) in &matched {
				table.remove(old.as_str())?;
				table.insert(new.as_str(), hash.as_str())?;
			}
			matched.len()
		};
		write_txn.commit()?;
		Ok(count)
	}

	/// Set the counter to `explicit` if given, else increment it (starting at 1)
	pub fn counter_increment(
		&self,
		kind: CounterKind,
		key: &str,
		explicit: Option<u32>,
	) -> std::result::Result<u32, SiloError> {
		self.update_counter(kind, key, CounterUpdate::Step(explicit))
	}

	/// Count `node`'s observation of `kind` on `key`. Repeated reports from
	/// the same node leave the count unchanged.
	pub fn counter_report(&self, kind: CounterKind, key: &str, node: usize) -> std::result::Result<u32, SiloError> {
		self.update_counter(kind, key, CounterUpdate::Report { node, dest: None })
	}

	/// Count `node`'s observation of a move of `from` and record its destination
	pub fn counter_report_move(
		&self,
		from: &str,
		to: &str,
		node: usize,
	) -> std::result::Result<u32, SiloError> {
		self.update_counter(CounterKind::Moved, from, CounterUpdate::Report { node, dest: Some(to) })
	}

	/// Set the reporters of `key` outright; the count becomes their number
	pub fn counter_set_nodes(
		&self,
		kind: CounterKind,
		key: &str,
		nodes: &[usize],
	) -> std::result::Result<u32, SiloError> {
		self.update_counter(kind, key, CounterUpdate::Reporters(nodes))
	}

	fn update_counter(
		&self,
		kind: CounterKind,
		key: &str,
		update: CounterUpdate<'_>,
	) -> std::result::Result<u32, SiloError> {
		let _guard = self.lock();
		let write_txn = self.db.begin_write()?;
		let count = {
			let mut table = write_txn.open_table(kind.table())?;
			let existing = match table.get(key)? {
				Some(v) => Some(decode_entry(key, v.value())?),
				None => None,
			};
			let mut entry = existing.unwrap_or_default();
			match update {
				CounterUpdate::Step(explicit) => entry.count = explicit.unwrap_or(entry.count + 1),
				CounterUpdate::Report { node, dest } => {
					entry.report(node);
					if let Some(dest) = dest {
						entry.dest = Some(dest.to_string());
					}
				}
				CounterUpdate::Reporters(nodes) => {
					let mut nodes = nodes.to_vec();
					nodes.sort_unstable();
					nodes.dedup();
					entry.count = nodes.len() as u32;
					entry.nodes = nodes;
				}
			}
			let bytes = encode_entry(key, &entry)?;
			table.insert(key, bytes.as_slice())?;
			entry.count
		};
		write_txn.commit()?;
		Ok(count)
	}

	pub fn counter_get(&self, kind: CounterKind, key: &str) -> std::result::Result<Option<u32>, SiloError> {
		Ok(self.counter_entry(kind, key)?.map(|e| e.count))
	}

	pub fn counter_entry(
		&self,
		kind: CounterKind,
		key: &str,
	) -> std::result::Result<Option<CounterEntry>, SiloError> {
		let _guard = self.lock();
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(kind.table())?;
		let entry = match table.get(key)? {
			Some(v) => Some(decode_entry(key, v.value())?),
			None => None,
		};
		Ok(entry)
	}

	/// Remove the counter and return its prior value
	pub fn counter_remove(&self, kind: CounterKind, key: &str) -> std::result::Result<Option<u32>, SiloError> {
		let _guard = self.lock();
		let write_txn = self.db.begin_write()?;
		let prior = {
			let mut table = write_txn.open_table(kind.table())?;
			let removed = match table.remove(key)? {
				Some(v) => Some(decode_entry(key, v.value())?.count),
				None => None,
			};
			removed
		};
		write_txn.commit()?;
		Ok(prior)
	}

	/// True if `key` has a pending counter of any kind
	pub fn in_any_counter(&self, key: &str) -> std::result::Result<bool, SiloError> {
		for kind in CounterKind::ALL.iter() {
			if self.counter_get(*kind, key)?.is_some() {
				return Ok(true);
			}
		}
		Ok(false)
	}

	/// Snapshot of one counter table
	pub fn counters(&self, kind: CounterKind) -> std::result::Result<Vec<(String, CounterEntry)>, SiloError> {
		let _guard = self.lock();
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(kind.table())?;
		let mut entries = Vec::new();
		for item in table.iter()? {
			let (k, v) = item?;
			let key = k.value().to_string();
			let entry = decode_entry(&key, v.value())?;
			entries.push((key, entry));
		}
		Ok(entries)
	}
}


// vim: ts=4
