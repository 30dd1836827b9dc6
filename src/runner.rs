//! Process wiring: silo, monitors, housekeeping, watchers, shutdown

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ComboxError, Result};
use crate::events::EventHandler;
use crate::monitor::{new_monitor_lock, ComboxDirMonitor, MonitorContext, MonitorOptions, NodeDirMonitor};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::silo::{CounterEntry, CounterKind, Silo};
use crate::watch;

/// Every monitor of one configuration, sharing a silo and a monitor lock
pub struct Monitors {
	pub combox: Arc<ComboxDirMonitor>,
	pub nodes: Vec<Arc<NodeDirMonitor>>,
}

impl Monitors {
	pub fn new(config: &Config, silo: Arc<Silo>, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
		let ctx = MonitorContext::new(
			config.mapper(),
			silo,
			new_monitor_lock(),
			scheduler,
			MonitorOptions::from_config(config)?,
		);
		let nodes = (0..ctx.num_nodes()).map(|i| Arc::new(NodeDirMonitor::new(ctx.clone(), i))).collect();
		Ok(Monitors { combox: Arc::new(ComboxDirMonitor::new(ctx)), nodes })
	}

	pub fn context(&self) -> &MonitorContext {
		self.combox.context()
	}

	/// Canonical pass first so local changes win, then the node pass
	pub fn housekeep(&self) -> Result<()> {
		self.combox.housekeep()?;
		if let Some(first) = self.nodes.first() {
			first.housekeep()?;
		}
		Ok(())
	}
}

/// Create the metadata, combox and node directories if missing
pub fn prepare_dirs(config: &Config) -> Result<()> {
	let mapper = config.mapper();
	let mut dirs = vec![crate::config::absolutize(&config.metadata_dir), mapper.combox_dir().to_path_buf()];
	dirs.extend(mapper.nodes().iter().cloned());
	for dir in dirs {
		fs::create_dir_all(&dir).map_err(|e| ComboxError::fs(&dir, e))?;
	}
	Ok(())
}

pub fn open_silo(config: &Config) -> Result<Arc<Silo>> {
	let silo = Silo::open_in(&crate::config::absolutize(&config.metadata_dir))?;
	info!("Opened silo {}", silo.path().display());
	Ok(Arc::new(silo))
}

/// Run until SIGINT or SIGTERM
pub async fn run(config: Config) -> Result<()> {
	config.validate()?;
	prepare_dirs(&config)?;
	let silo = open_silo(&config)?;
	let monitors = Monitors::new(&config, silo, Arc::new(TokioScheduler::current()))?;

	monitors.housekeep()?;

	let mapper = monitors.context().mapper.clone();
	let mut handles = Vec::with_capacity(mapper.num_nodes() + 1);
	let combox: Arc<dyn EventHandler> = monitors.combox.clone();
	handles.push(watch::spawn("combox", mapper.combox_dir(), combox)?);
	for (i, node) in monitors.nodes.iter().enumerate() {
		let handler: Arc<dyn EventHandler> = node.clone();
		match watch::spawn(&format!("node{}", i), &mapper.nodes()[i], handler) {
			Ok(h) => handles.push(h),
			Err(e) => {
				for h in handles {
					h.stop_and_join();
				}
				return Err(e);
			}
		}
	}
	info!("combox running with {} nodes", mapper.num_nodes());

	crate::utils::wait_for_shutdown().await;

	// Joining blocks until in-flight events are handled
	let joined = tokio::task::spawn_blocking(move || {
		for h in handles {
			info!("Stopping watcher {}", h.name());
			h.stop_and_join();
		}
	})
	.await;
	if let Err(e) = joined {
		warn!("Shutdown did not complete cleanly: {}", e);
	}
	info!("combox stopped");
	Ok(())
}

/// Reconcile once and exit
pub fn housekeep_only(config: &Config, scheduler: Arc<dyn Scheduler>) -> Result<()> {
	config.validate()?;
	prepare_dirs(config)?;
	let silo = open_silo(config)?;
	Monitors::new(config, silo, scheduler)?.housekeep()
}

// ============================================================================
// Dump
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiloDump {
	pub files: BTreeMap<String, String>,
	pub counters: BTreeMap<String, BTreeMap<String, CounterEntry>>,
}

pub fn dump_silo(silo: &Silo) -> Result<SiloDump> {
	let files = silo.entries()?.into_iter().collect();
	let mut counters = BTreeMap::new();
	for kind in CounterKind::ALL.iter() {
		let table: BTreeMap<String, CounterEntry> = silo.counters(*kind)?.into_iter().collect();
		counters.insert(kind.name().to_string(), table);
	}
	Ok(SiloDump { files, counters })
}

/// Pretty JSON of the tracked files and pending counters
pub fn dump(config: &Config) -> Result<String> {
	let silo = open_silo(config)?;
	let dump = dump_silo(&silo)?;
	serde_json::to_string_pretty(&dump).map_err(|e| ComboxError::config(format!("Cannot serialize dump: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::NodeConfig;
	use crate::scheduler::ManualScheduler;
	use tempfile::TempDir;

	fn config(tmp: &TempDir) -> Config {
		Config {
			combox_dir: tmp.path().join("combox"),
			metadata_dir: tmp.path().join("meta"),
			passphrase: "topsecret".to_string(),
			nodes: (0..2)
				.map(|i| NodeConfig {
					name: format!("n{}", i),
					path: tmp.path().join(format!("node{}", i)),
					size_quota_mib: 0,
				})
				.collect(),
			..Config::default()
		}
	}

	#[test]
	fn test_housekeep_only_shards_existing_files() {
		let tmp = TempDir::new().unwrap();
		let config = config(&tmp);
		prepare_dirs(&config).unwrap();
		fs::create_dir_all(config.combox_dir.join("sub")).unwrap();
		fs::write(config.combox_dir.join("sub/a.txt"), b"offline edit").unwrap();

		housekeep_only(&config, Arc::new(ManualScheduler::new())).unwrap();
		assert!(tmp.path().join("node0/sub/a.txt.shard0").is_file());
		assert!(tmp.path().join("node1/sub/a.txt.shard1").is_file());

		let json = dump(&config).unwrap();
		let value: serde_json::Value = serde_json::from_str(&json).unwrap();
		assert_eq!(value["files"]["sub/a.txt"], crate::codec::hash_bytes(b"offline edit"));
		assert!(value["counters"]["created"].as_object().unwrap().is_empty());
	}

	#[test]
	fn test_dump_counters() {
		let tmp = TempDir::new().unwrap();
		let silo = Silo::open_in(tmp.path()).unwrap();
		silo.counter_report_move("a", "b", 1).unwrap();
		let dump = dump_silo(&silo).unwrap();
		let moved = &dump.counters["moved"]["a"];
		assert_eq!(moved.count, 1);
		assert_eq!(moved.dest.as_deref(), Some("b"));
		assert_eq!(moved.nodes, vec![1]);
	}
}

// vim: ts=4
