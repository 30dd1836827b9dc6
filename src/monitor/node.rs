//! Monitor for one node directory
//!
//! Events in a node directory are written by a third-party sync agent and
//! cannot be trusted on their own. Each observation bumps a quorum counter in
//! the silo; the combox directory is only touched once all N node monitors
//! have reported the same transition for the same path.
//!
//! Some agents do not report what actually happened:
//! - a download lands as a temporary file that is renamed into place, which
//!   looks like a move from a non-shard path;
//! - an update may be written as delete + recreate, and the "delete" may be a
//!   rename into the agent's cache directory;
//! - child deletions of a removed directory can trail the directory event.
//! The handlers below account for each of these.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::MonitorContext;
use crate::codec;
use crate::error::{ComboxError, Result};
use crate::events::EventHandler;
use crate::paths::is_shard;
use crate::silo::CounterKind;

#[derive(Clone)]
pub struct NodeDirMonitor {
	ctx: Arc<MonitorContext>,
	node: usize,
	num_nodes: usize,
}

impl NodeDirMonitor {
	/// Monitor for the `node`-th node directory (in sorted order)
	pub fn new(ctx: MonitorContext, node: usize) -> Self {
		let num_nodes = ctx.num_nodes();
		NodeDirMonitor { ctx: Arc::new(ctx), node, num_nodes }
	}

	pub fn context(&self) -> &MonitorContext {
		&self.ctx
	}

	pub fn root(&self) -> Option<&Path> {
		self.ctx.mapper.nodes().get(self.node).map(|p| p.as_path())
	}

	fn in_agent_cache(&self, path: &Path) -> bool {
		self.ctx.options.agent_cache.matches_component(path)
	}

	fn quorum(&self, count: u32) -> bool {
		count as usize >= self.num_nodes
	}

	// ------------------------------------------------------------------
	// Commits (monitor lock held by caller)
	// ------------------------------------------------------------------

	/// Rebuild `canonical` from its shards and record the hash
	fn reconstruct(&self, canonical: &Path, key: &str) -> Result<()> {
		let data = self.ctx.read_shards(canonical)?;
		let hash = codec::hash_bytes(&data);
		if canonical.is_file() && self.ctx.silo.is_stale(key, &hash)? == Some(false) {
			debug!("{} already up to date", key);
			return Ok(());
		}
		if let Some(parent) = canonical.parent() {
			fs::create_dir_all(parent).map_err(|e| ComboxError::fs(parent, e))?;
		}
		fs::write(canonical, &data).map_err(|e| ComboxError::fs(canonical, e))?;
		self.ctx.silo.put(key, &hash)?;
		Ok(())
	}

	fn commit_create(&self, canonical: &Path, key: &str) -> Result<()> {
		let present = self.ctx.count_shards(canonical)?;
		if present < self.num_nodes {
			debug!("{}: {}/{} shards present, waiting", key, present, self.num_nodes);
			return Ok(());
		}
		self.reconstruct(canonical, key)?;
		self.ctx.silo.counter_remove(CounterKind::Created, key)?;
		info!("Created file from nodes: {}", canonical.display());
		Ok(())
	}

	fn created_file(&self, path: &Path) -> Result<()> {
		let canonical = self.ctx.mapper.to_canonical(path)?;
		let key = self.ctx.mapper.key(&canonical)?;
		let _guard = self.ctx.lock();

		if canonical.exists() && self.ctx.silo.contains(&key)? {
			// Tracked file whose shard was rewritten by delete + recreate
			return self.modified_file_locked(path, &canonical, &key);
		}
		if self.ctx.silo.counter_remove(CounterKind::Deleted, &key)?.is_some() {
			info!("Shard of {} reappeared, pending delete cancelled", key);
		}

		let count = self.ctx.silo.counter_report(CounterKind::Created, &key, self.node)?;
		debug!("node {}: {} created {}/{}", self.node, key, count, self.num_nodes);
		if self.quorum(count) {
			self.commit_create(&canonical, &key)?;
		}
		Ok(())
	}

	fn created_dir(&self, path: &Path) -> Result<()> {
		let canonical = self.ctx.mapper.to_canonical(path)?;
		let key = self.ctx.mapper.key(&canonical)?;
		let _guard = self.ctx.lock();

		if canonical.exists() {
			debug!("Directory {} already exists", canonical.display());
			self.ctx.silo.counter_remove(CounterKind::Created, &key)?;
			return Ok(());
		}
		let count = self.ctx.silo.counter_report(CounterKind::Created, &key, self.node)?;
		if self.quorum(count) {
			fs::create_dir_all(&canonical).map_err(|e| ComboxError::fs(&canonical, e))?;
			self.ctx.silo.counter_remove(CounterKind::Created, &key)?;
			info!("Created directory from nodes: {}", canonical.display());
		}
		Ok(())
	}

	fn modified_file(&self, path: &Path) -> Result<()> {
		let canonical = self.ctx.mapper.to_canonical(path)?;
		let key = self.ctx.mapper.key(&canonical)?;
		let _guard = self.ctx.lock();
		self.modified_file_locked(path, &canonical, &key)
	}

	fn modified_file_locked(&self, path: &Path, canonical: &Path, key: &str) -> Result<()> {
		if !self.ctx.silo.contains(key)? {
			debug!("{} not tracked yet, left to the creation count", key);
			return Ok(());
		}
		let cancelled = self.ctx.silo.counter_remove(CounterKind::Deleted, key)?.is_some();
		if cancelled {
			info!("Shard of {} rewritten, pending delete cancelled", key);
		}
		if self.ctx.shard_matches_canonical(path, canonical) {
			debug!("Shard {} matches local content", path.display());
			return Ok(());
		}

		let present = self.ctx.count_shards(canonical)?;
		if present != self.num_nodes {
			debug!("{}: {}/{} shards present, not counting", key, present, self.num_nodes);
			return Ok(());
		}
		let count = self.ctx.silo.counter_report(CounterKind::Modified, key, self.node)?;
		debug!("node {}: {} modified {}/{}", self.node, key, count, self.num_nodes);
		if !self.quorum(count) {
			return Ok(());
		}
		if self.ctx.has_local_edit(canonical) {
			// The local edit is re-sharded next and replaces these shards
			self.ctx.silo.counter_remove(CounterKind::Modified, key)?;
			info!("{} is being edited locally, remote modification dropped", key);
			return Ok(());
		}
		self.reconstruct(canonical, key)?;
		self.ctx.silo.counter_remove(CounterKind::Modified, key)?;
		info!("Modified file from nodes: {}", canonical.display());
		Ok(())
	}

	fn deleted_file(&self, path: &Path) -> Result<()> {
		let canonical = self.ctx.mapper.to_canonical(path)?;
		let key = self.ctx.mapper.key(&canonical)?;
		let _guard = self.ctx.lock();

		if !self.ctx.silo.contains(&key)? {
			debug!("{} not tracked, ignoring shard removal", key);
			return Ok(());
		}
		// A delete supersedes half-counted creates and modifies
		self.ctx.silo.counter_remove(CounterKind::Created, &key)?;
		self.ctx.silo.counter_remove(CounterKind::Modified, &key)?;

		let count = self.ctx.silo.counter_report(CounterKind::Deleted, &key, self.node)?;
		debug!("node {}: {} deleted {}/{}", self.node, key, count, self.num_nodes);
		if self.quorum(count) {
			let this = self.clone();
			self.ctx.scheduler.schedule(
				self.ctx.options.file_delete_delay,
				Box::new(move || {
					if let Err(e) = this.finish_file_delete(&canonical, &key) {
						error!("Deferred delete of {} failed: {}", key, e);
					}
				}),
			);
		}
		Ok(())
	}

	/// Deferred half of a file delete: only commit if the counter still
	/// reads N and no shard came back in the meantime
	fn finish_file_delete(&self, canonical: &Path, key: &str) -> Result<()> {
		let _guard = self.ctx.lock();
		match self.ctx.silo.counter_get(CounterKind::Deleted, key)? {
			Some(count) if self.quorum(count) => {}
			_ => {
				debug!("Delete of {} no longer pending", key);
				return Ok(());
			}
		}
		if self.ctx.count_shards(canonical)? > 0 {
			info!("Shards of {} are back, not deleting", key);
			self.ctx.silo.counter_remove(CounterKind::Deleted, key)?;
			return Ok(());
		}

		super::remove_file_if_exists(canonical)?;
		self.ctx.silo.remove(key)?;
		self.ctx.silo.counter_remove(CounterKind::Deleted, key)?;
		info!("Deleted file from nodes: {}", canonical.display());
		Ok(())
	}

	fn deleted_dir(&self, path: &Path) -> Result<()> {
		let canonical = self.ctx.mapper.to_canonical(path)?;
		let key = self.ctx.mapper.key(&canonical)?;
		let _guard = self.ctx.lock();

		if !canonical.exists() {
			debug!("Directory {} already gone", canonical.display());
			self.ctx.silo.counter_remove(CounterKind::Deleted, &key)?;
			return Ok(());
		}
		let count = self.ctx.silo.counter_report(CounterKind::Deleted, &key, self.node)?;
		if self.quorum(count) {
			self.try_remove_dir(canonical, key, 0)?;
		}
		Ok(())
	}

	/// Remove the directory if empty, otherwise retry later: child deletions
	/// may still be on their way
	fn try_remove_dir(&self, canonical: PathBuf, key: String, attempt: u32) -> Result<()> {
		if !canonical.exists() {
			self.ctx.silo.counter_remove(CounterKind::Deleted, &key)?;
			return Ok(());
		}
		let empty = fs::read_dir(&canonical)
			.map_err(|e| ComboxError::fs(&canonical, e))?
			.next()
			.is_none();
		if empty {
			fs::remove_dir(&canonical).map_err(|e| ComboxError::fs(&canonical, e))?;
			self.ctx.silo.counter_remove(CounterKind::Deleted, &key)?;
			info!("Deleted directory from nodes: {}", canonical.display());
			return Ok(());
		}
		if attempt >= self.ctx.options.dir_delete_retries {
			warn!("Directory {} still not empty, giving up", canonical.display());
			self.ctx.silo.counter_remove(CounterKind::Deleted, &key)?;
			return Ok(());
		}

		debug!("Directory {} not empty yet, retrying (attempt {})", canonical.display(), attempt + 1);
		let this = self.clone();
		self.ctx.scheduler.schedule(
			self.ctx.options.dir_delete_delay,
			Box::new(move || {
				let _guard = this.ctx.lock();
				let pending = match this.ctx.silo.counter_get(CounterKind::Deleted, &key) {
					Ok(Some(count)) => this.quorum(count),
					Ok(None) => false,
					Err(e) => {
						error!("Cannot read delete counter of {}: {}", key, e);
						false
					}
				};
				if !pending {
					return;
				}
				if let Err(e) = this.try_remove_dir(canonical, key.clone(), attempt + 1) {
					error!("Deferred delete of directory {} failed: {}", key, e);
				}
			}),
		);
		Ok(())
	}

	fn moved(&self, from: &Path, to: &Path, is_dir: bool) -> Result<()> {
		let canonical_from = self.ctx.mapper.to_canonical(from)?;
		let canonical_to = self.ctx.mapper.to_canonical(to)?;
		let from_key = self.ctx.mapper.key(&canonical_from)?;
		let to_key = self.ctx.mapper.key(&canonical_to)?;
		let _guard = self.ctx.lock();

		if !canonical_from.exists() {
			debug!("Move of {} already applied or nothing to move", from_key);
			return Ok(());
		}
		if canonical_to.exists() {
			warn!("Not moving {} over existing {}", from_key, to_key);
			return Ok(());
		}

		let count = self.ctx.silo.counter_report_move(&from_key, &to_key, self.node)?;
		debug!("node {}: {} moved {}/{}", self.node, from_key, count, self.num_nodes);
		if !self.quorum(count) {
			return Ok(());
		}

		let dest = self
			.ctx
			.silo
			.counter_entry(CounterKind::Moved, &from_key)?
			.and_then(|e| e.dest)
			.unwrap_or(to_key);
		let dest_path = self.ctx.mapper.from_key(&dest);
		super::rename_if_exists(&canonical_from, &dest_path)?;
		if is_dir {
			self.ctx.silo.rename_prefix(&from_key, &dest)?;
		} else {
			self.ctx.silo.rename(&from_key, &dest)?;
		}
		self.ctx.silo.counter_remove(CounterKind::Moved, &from_key)?;
		info!("Moved from nodes: {} -> {}", canonical_from.display(), dest_path.display());
		Ok(())
	}

	// ------------------------------------------------------------------
	// Housekeeping
	// ------------------------------------------------------------------

	/// Startup reconciliation across all node directories. Only one node
	/// monitor needs to run it.
	pub fn housekeep(&self) -> Result<()> {
		let _guard = self.ctx.lock();
		if let Some(missing) = self.ctx.mapper.nodes().iter().find(|n| !n.is_dir()) {
			warn!("Node directory {} is missing, skipping housekeeping", missing.display());
			return Ok(());
		}
		info!("Housekeeping {} node directories", self.num_nodes);

		for key in self.ctx.silo.keys()? {
			if let Err(e) = self.housekeep_tracked(&key) {
				warn!("Housekeeping {} failed: {}", key, e);
			}
		}

		// Untracked shards, counted per canonical path over all nodes
		let mut arrivals: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
		for node in 0..self.num_nodes {
			for canonical in self.ctx.scan_node(node) {
				if self.in_agent_cache(&canonical) {
					continue;
				}
				arrivals.entry(canonical).or_insert_with(Vec::new).push(node);
			}
		}
		for (canonical, nodes) in arrivals {
			if let Err(e) = self.housekeep_untracked(&canonical, &nodes) {
				warn!("Housekeeping {} failed: {}", canonical.display(), e);
			}
		}
		Ok(())
	}

	fn housekeep_tracked(&self, key: &str) -> Result<()> {
		let canonical = self.ctx.mapper.from_key(key);
		let missing: Vec<usize> = self
			.ctx
			.mapper
			.shard_paths(&canonical)?
			.iter()
			.enumerate()
			.filter(|(_, p)| !p.is_file())
			.map(|(i, _)| i)
			.collect();
		let present = self.num_nodes - missing.len();
		if present == 0 {
			super::remove_file_if_exists(&canonical)?;
			self.ctx.silo.remove(key)?;
			self.ctx.silo.counter_remove(CounterKind::Deleted, key)?;
			info!("Deleted {} (removed from every node)", key);
		} else if present < self.num_nodes {
			self.ctx.silo.counter_set_nodes(CounterKind::Deleted, key, &missing)?;
			debug!("{}: {} of {} shards missing", key, missing.len(), self.num_nodes);
		} else if self.ctx.silo.counter_remove(CounterKind::Deleted, key)?.is_some() {
			debug!("{}: all shards present, dropped stale delete count", key);
		}
		Ok(())
	}

	fn housekeep_untracked(&self, canonical: &Path, nodes: &[usize]) -> Result<()> {
		let key = self.ctx.mapper.key(canonical)?;
		if self.ctx.silo.contains(&key)? {
			return Ok(());
		}
		let count = self.ctx.silo.counter_set_nodes(CounterKind::Created, &key, nodes)?;
		if !self.quorum(count) {
			debug!("{}: {} of {} shards arrived", key, count, self.num_nodes);
			return Ok(());
		}
		self.reconstruct(canonical, &key)?;
		self.ctx.silo.counter_remove(CounterKind::Created, &key)?;
		info!("Created {} (arrived on every node)", key);
		Ok(())
	}
}

impl EventHandler for NodeDirMonitor {
	fn on_created(&self, path: &Path, is_dir: bool) -> Result<()> {
		if self.in_agent_cache(path) {
			return Ok(());
		}
		if is_dir {
			return self.created_dir(path);
		}
		if !is_shard(path) {
			debug!("Ignoring non-shard {}", path.display());
			return Ok(());
		}
		self.created_file(path)
	}

	fn on_modified(&self, path: &Path, is_dir: bool) -> Result<()> {
		if is_dir || !is_shard(path) || self.in_agent_cache(path) {
			return Ok(());
		}
		self.modified_file(path)
	}

	fn on_deleted(&self, path: &Path, is_dir: bool) -> Result<()> {
		if self.in_agent_cache(path) {
			return Ok(());
		}
		if is_dir {
			return self.deleted_dir(path);
		}
		if !is_shard(path) {
			return Ok(());
		}
		self.deleted_file(path)
	}

	fn on_moved(&self, from: &Path, to: &Path, is_dir: bool) -> Result<()> {
		if is_dir {
			if self.in_agent_cache(to) {
				return self.deleted_dir(from);
			}
			if self.in_agent_cache(from) {
				return self.created_dir(to);
			}
			return self.moved(from, to, true);
		}

		match (is_shard(from) && !self.in_agent_cache(from), is_shard(to) && !self.in_agent_cache(to)) {
			(true, true) => self.moved(from, to, false),
			// Shard parked in the agent's cache: tentative delete
			(true, false) => self.deleted_file(from),
			// Temporary download renamed into place
			(false, true) => {
				let canonical = self.ctx.mapper.to_canonical(to)?;
				if canonical.exists() {
					self.modified_file(to)
				} else {
					self.created_file(to)
				}
			}
			(false, false) => Ok(()),
		}
	}
}


// vim: ts=4
