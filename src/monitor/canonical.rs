//! Monitor for the combox directory
//!
//! Local changes are pushed to every node directory immediately: a new or
//! changed file is re-sharded, a deleted file loses its shards, a rename is
//! mirrored shard by shard.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::MonitorContext;
use crate::error::{ComboxError, Result};
use crate::events::EventHandler;

pub struct ComboxDirMonitor {
	ctx: MonitorContext,
	/// Files created but not yet modified since
	just_created: Mutex<HashSet<PathBuf>>,
}

impl ComboxDirMonitor {
	pub fn new(ctx: MonitorContext) -> Self {
		ComboxDirMonitor { ctx, just_created: Mutex::new(HashSet::new()) }
	}

	pub fn context(&self) -> &MonitorContext {
		&self.ctx
	}

	fn is_temp(&self, path: &Path) -> bool {
		self.ctx.options.temp_files.matches_name(path)
	}

	/// Shard `path` and record its hash, unless the silo already has it
	fn sync_file(&self, path: &Path) -> Result<bool> {
		let key = self.ctx.mapper.key(path)?;
		let data = fs::read(path).map_err(|e| ComboxError::fs(path, e))?;
		let hash = crate::codec::hash_bytes(&data);
		if self.ctx.silo.is_stale(&key, &hash)? == Some(false)
			&& self.ctx.count_shards(path)? == self.ctx.num_nodes()
		{
			debug!("Unchanged, not re-sharding: {}", path.display());
			return Ok(false);
		}
		self.ctx.write_shards(path, &data)?;
		self.ctx.silo.put(&key, &hash)?;
		Ok(true)
	}

	/// Startup reconciliation. Holds the monitor lock for the whole pass.
	pub fn housekeep(&self) -> Result<()> {
		let _guard = self.ctx.lock();
		info!("Housekeeping combox directory {}", self.ctx.mapper.combox_dir().display());

		// Files gone from disk while we were not looking
		for key in self.ctx.silo.keys()? {
			let path = self.ctx.mapper.from_key(&key);
			if let Err(e) = self.forget_if_gone(&key, &path) {
				warn!("Housekeeping {} failed: {}", key, e);
			}
		}

		let mut visited = Vec::new();
		super::walk(self.ctx.mapper.combox_dir(), &mut |path, is_dir| {
			visited.push((path.to_path_buf(), is_dir))
		});
		for (path, is_dir) in visited {
			let result = if is_dir {
				self.ctx.mk_nodedirs(&path)
			} else if self.is_temp(&path) {
				continue;
			} else {
				self.housekeep_file(&path)
			};
			if let Err(e) = result {
				warn!("Housekeeping {} failed: {}", path.display(), e);
			}
		}
		Ok(())
	}

	fn forget_if_gone(&self, key: &str, path: &Path) -> Result<()> {
		if path.exists() || self.ctx.silo.in_any_counter(key)? {
			return Ok(());
		}
		self.ctx.remove_shards(path)?;
		self.ctx.silo.remove(key)?;
		info!("Removed {} (deleted while offline)", key);
		Ok(())
	}

	fn housekeep_file(&self, path: &Path) -> Result<()> {
		let key = self.ctx.mapper.key(path)?;
		match self.ctx.silo.is_stale_file(&key, path)? {
			Some(false) => Ok(()),
			Some(true) => {
				let hash = self.ctx.shard_file(path)?;
				self.ctx.silo.put(&key, &hash)?;
				info!("Updated {} (modified while offline)", key);
				Ok(())
			}
			None => {
				let hash = self.ctx.shard_file(path)?;
				self.ctx.silo.put(&key, &hash)?;
				info!("Added {} (created while offline)", key);
				Ok(())
			}
		}
	}

	fn forget_just_created(&self, path: &Path) -> bool {
		self.just_created.lock().unwrap_or_else(|e| e.into_inner()).remove(path)
	}

	/// A deleted path that was a directory still has its mirror on node 0
	fn was_directory(&self, path: &Path) -> Result<bool> {
		let key = self.ctx.mapper.key(path)?;
		if self.ctx.silo.contains(&key)? {
			return Ok(false);
		}
		Ok(self.ctx.mapper.to_node_path(path, 0, true)?.is_dir())
	}
}

impl EventHandler for ComboxDirMonitor {
	fn on_created(&self, path: &Path, is_dir: bool) -> Result<()> {
		if is_dir {
			let _guard = self.ctx.lock();
			self.ctx.mk_nodedirs(path)?;
			info!("Created directory: {}", path.display());
			return Ok(());
		}
		if self.is_temp(path) {
			debug!("Ignoring temporary file {}", path.display());
			return Ok(());
		}

		let _guard = self.ctx.lock();
		if self.sync_file(path)? {
			self.just_created.lock().unwrap_or_else(|e| e.into_inner()).insert(path.to_path_buf());
			info!("Created file: {}", path.display());
		}
		Ok(())
	}

	fn on_modified(&self, path: &Path, is_dir: bool) -> Result<()> {
		if is_dir || self.is_temp(path) {
			return Ok(());
		}
		let meta = match fs::metadata(path) {
			Ok(m) => m,
			Err(_) => {
				debug!("Modified file vanished: {}", path.display());
				return Ok(());
			}
		};

		let key = self.ctx.mapper.key(path)?;
		if self.forget_just_created(path) && self.ctx.silo.is_stale_file(&key, path)? == Some(false) {
			debug!("Skipping create-then-modify duplicate for {}", path.display());
			return Ok(());
		}

		// Give the writer time to finish before reading. Node monitors hold
		// off modifying this file until it is re-sharded.
		let _edit = self.ctx.begin_local_edit(path);
		self.ctx.scheduler.block_for(self.ctx.options.settle_delay(meta.len()));

		let _guard = self.ctx.lock();
		if !path.is_file() {
			return Ok(());
		}
		if self.sync_file(path)? {
			info!("Modified file: {}", path.display());
		}
		Ok(())
	}

	fn on_deleted(&self, path: &Path, is_dir: bool) -> Result<()> {
		let _guard = self.ctx.lock();
		if is_dir || self.was_directory(path)? {
			self.ctx.rm_nodedirs(path)?;
			let prefix = self.ctx.mapper.key(path)?;
			for key in self.ctx.silo.keys()? {
				if key.starts_with(&format!("{}/", prefix)) {
					self.ctx.silo.remove(&key)?;
				}
			}
			info!("Deleted directory: {}", path.display());
			return Ok(());
		}

		self.ctx.remove_shards(path)?;
		let key = self.ctx.mapper.key(path)?;
		self.ctx.silo.remove(&key)?;
		info!("Deleted file: {}", path.display());
		Ok(())
	}

	fn on_moved(&self, from: &Path, to: &Path, is_dir: bool) -> Result<()> {
		if !is_dir && self.is_temp(from) {
			// Editors save by renaming a temporary over the real file
			return self.on_created(to, false);
		}
		if !is_dir && self.is_temp(to) {
			return self.on_deleted(from, false);
		}

		let _guard = self.ctx.lock();
		let old_key = self.ctx.mapper.key(from)?;
		let new_key = self.ctx.mapper.key(to)?;
		if is_dir {
			self.ctx.move_nodedirs(from, to)?;
			let moved = self.ctx.silo.rename_prefix(&old_key, &new_key)?;
			info!("Moved directory: {} -> {} ({} files)", from.display(), to.display(), moved);
			return Ok(());
		}

		self.ctx.move_shards(from, to)?;
		if !self.ctx.silo.rename(&old_key, &new_key)? {
			// Untracked source: treat the destination as new
			if let Err(e) = self.sync_file(to) {
				error!("Cannot shard moved file {}: {}", to.display(), e);
			}
		}
		info!("Moved file: {} -> {}", from.display(), to.display());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::monitor::{new_monitor_lock, MonitorOptions};
	use crate::paths::PathMapper;
	use crate::scheduler::ManualScheduler;
	use crate::silo::Silo;
	use std::sync::Arc;
	use std::time::Duration;
	use tempfile::TempDir;

	fn monitor(tmp: &TempDir) -> (ComboxDirMonitor, Arc<ManualScheduler>) {
		let combox = tmp.path().join("combox");
		fs::create_dir_all(&combox).unwrap();
		let nodes: Vec<PathBuf> = (0..2).map(|i| tmp.path().join(format!("node{}", i))).collect();
		for node in &nodes {
			fs::create_dir_all(node).unwrap();
		}
		let sched = Arc::new(ManualScheduler::new());
		let ctx = MonitorContext::new(
			PathMapper::new(combox, nodes),
			Arc::new(Silo::open_in(tmp.path()).unwrap()),
			new_monitor_lock(),
			sched.clone(),
			MonitorOptions::new("topsecret").unwrap(),
		);
		(ComboxDirMonitor::new(ctx), sched)
	}

	#[test]
	fn test_temp_files_ignored() {
		let tmp = TempDir::new().unwrap();
		let (mon, _) = monitor(&tmp);
		let path = mon.ctx.mapper.combox_dir().join(".#notes.txt");
		fs::write(&path, b"x").unwrap();
		mon.on_created(&path, false).unwrap();
		assert_eq!(mon.ctx.count_shards(&path).unwrap(), 0);
	}

	#[test]
	fn test_create_then_modify_duplicate_skips_delay() {
		let tmp = TempDir::new().unwrap();
		let (mon, sched) = monitor(&tmp);
		let path = mon.ctx.mapper.combox_dir().join("a.txt");
		fs::write(&path, b"content").unwrap();

		mon.on_created(&path, false).unwrap();
		mon.on_modified(&path, false).unwrap();
		assert!(sched.slept().is_empty());

		fs::write(&path, b"new content").unwrap();
		mon.on_modified(&path, false).unwrap();
		assert_eq!(sched.slept(), vec![Duration::from_secs(1)]);
		assert_eq!(mon.ctx.read_shards(&path).unwrap(), b"new content".to_vec());
	}

	#[test]
	fn test_directory_lifecycle() {
		let tmp = TempDir::new().unwrap();
		let (mon, _) = monitor(&tmp);
		let dir = mon.ctx.mapper.combox_dir().join("foo");
		fs::create_dir(&dir).unwrap();
		mon.on_created(&dir, true).unwrap();
		for node in mon.ctx.mapper.dir_paths(&dir).unwrap() {
			assert!(node.is_dir());
		}

		let file = dir.join("bar.txt");
		fs::write(&file, b"bar").unwrap();
		mon.on_created(&file, false).unwrap();

		let renamed = mon.ctx.mapper.combox_dir().join("baz");
		fs::rename(&dir, &renamed).unwrap();
		mon.on_moved(&dir, &renamed, true).unwrap();
		assert_eq!(mon.ctx.silo.keys().unwrap(), vec!["baz/bar.txt".to_string()]);
		assert_eq!(mon.ctx.count_shards(&renamed.join("bar.txt")).unwrap(), 2);

		fs::remove_dir_all(&renamed).unwrap();
		// Some backends report directory removal without the directory flag
		mon.on_deleted(&renamed, false).unwrap();
		for node in mon.ctx.mapper.dir_paths(&renamed).unwrap() {
			assert!(!node.exists());
		}
		assert!(mon.ctx.silo.keys().unwrap().is_empty());
	}

	#[test]
	fn test_rename_from_temp_is_create() {
		let tmp = TempDir::new().unwrap();
		let (mon, _) = monitor(&tmp);
		let temp = mon.ctx.mapper.combox_dir().join("a.txt~");
		let real = mon.ctx.mapper.combox_dir().join("a.txt");
		fs::write(&real, b"saved").unwrap();
		mon.on_moved(&temp, &real, false).unwrap();
		assert_eq!(mon.ctx.read_shards(&real).unwrap(), b"saved".to_vec());
	}
}

// vim: ts=4
