//! Configuration for combox
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (~/.combox/config.toml, or --config)
//! 3. Environment variables (COMBOX_PASSPHRASE)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ComboxError, Result};
use crate::paths::{default_agent_cache_patterns, default_temp_patterns, PathMapper};

/// Environment variable that overrides the configured passphrase
pub const PASSPHRASE_ENV: &str = "COMBOX_PASSPHRASE";

const MIB: u64 = 1024 * 1024;

/// One node directory, kept in sync with a storage provider by its own agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
	pub name: String,
	pub path: PathBuf,
	#[serde(rename = "sizeQuotaMiB", default)]
	pub size_quota_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// DIRECTORIES & SECRET
	// ========================================================================
	/// Directory the user edits
	#[serde(rename = "comboxDirectory")]
	pub combox_dir: PathBuf,

	/// Directory holding the silo
	#[serde(rename = "metadataDirectory")]
	pub metadata_dir: PathBuf,

	pub passphrase: String,

	// ========================================================================
	// EVENT FILTERING
	// ========================================================================
	/// File names never sharded (editor temporaries)
	pub temp_patterns: Vec<String>,

	/// Path components marking a sync agent's cache or trash
	pub agent_cache_patterns: Vec<String>,

	// ========================================================================
	// TIMING
	// ========================================================================
	/// Wait before committing a file delete seen on every node
	pub file_delete_delay_secs: u64,

	/// Wait before retrying a directory delete while it is not yet empty
	pub dir_delete_delay_secs: u64,

	pub dir_delete_retries: u32,

	/// Settle time before re-sharding a modified file: one second per this many bytes
	pub settle_bytes_per_sec: u64,

	// ========================================================================
	// NODES
	// ========================================================================
	pub nodes: Vec<NodeConfig>,
}

impl Default for Config {
	fn default() -> Self {
		let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
		Config {
			combox_dir: home.join("combox"),
			metadata_dir: home.join(".combox"),
			passphrase: String::new(),
			temp_patterns: default_temp_patterns(),
			agent_cache_patterns: default_agent_cache_patterns(),
			file_delete_delay_secs: 3,
			dir_delete_delay_secs: 15,
			dir_delete_retries: 4,
			settle_bytes_per_sec: 30 * MIB,
			nodes: vec![],
		}
	}
}

impl Config {
	/// `$HOME/.combox/config.toml`
	pub fn default_path() -> PathBuf {
		Config::default().metadata_dir.join("config.toml")
	}

	/// Load from a TOML file and apply environment overrides
	pub fn load(path: &Path) -> Result<Self> {
		let text = fs::read_to_string(path).map_err(|e| ComboxError::fs(path, e))?;
		let mut config: Config = toml::from_str(&text)
			.map_err(|e| ComboxError::config(format!("{}: {}", path.display(), e)))?;
		config.apply_env();
		Ok(config)
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		let text = toml::to_string_pretty(self)
			.map_err(|e| ComboxError::config(format!("Failed to serialize config: {}", e)))?;
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|e| ComboxError::fs(parent, e))?;
		}
		fs::write(path, text).map_err(|e| ComboxError::fs(path, e))
	}

	pub fn apply_env(&mut self) {
		if let Ok(pass) = std::env::var(PASSPHRASE_ENV) {
			if !pass.is_empty() {
				self.passphrase = pass;
			}
		}
	}

	pub fn validate(&self) -> Result<()> {
		if self.nodes.is_empty() {
			return Err(ComboxError::config("at least one node directory is required"));
		}
		if self.passphrase.is_empty() {
			return Err(ComboxError::config("passphrase must not be empty"));
		}
		if self.settle_bytes_per_sec == 0 {
			return Err(ComboxError::config("settleBytesPerSec must be greater than 0"));
		}

		let combox = absolutize(&self.combox_dir);
		let mut seen = HashSet::new();
		for node in &self.nodes {
			let path = absolutize(&node.path);
			if !seen.insert(path.clone()) {
				return Err(ComboxError::config(format!(
					"node directory listed twice: {}",
					path.display()
				)));
			}
			if path.starts_with(&combox) || combox.starts_with(&path) {
				return Err(ComboxError::config(format!(
					"node {} ({}) overlaps the combox directory",
					node.name,
					path.display()
				)));
			}
		}
		Ok(())
	}

	/// Absolute node paths, sorted. This order fixes each node's shard index.
	pub fn node_paths(&self) -> Vec<PathBuf> {
		let mut paths: Vec<PathBuf> = self.nodes.iter().map(|n| absolutize(&n.path)).collect();
		paths.sort();
		paths
	}

	pub fn mapper(&self) -> PathMapper {
		PathMapper::new(absolutize(&self.combox_dir), self.node_paths())
	}

	pub fn file_delete_delay(&self) -> Duration {
		Duration::from_secs(self.file_delete_delay_secs)
	}

	pub fn dir_delete_delay(&self) -> Duration {
		Duration::from_secs(self.dir_delete_delay_secs)
	}
}

/// Resolve against the current directory without touching the filesystem
pub fn absolutize(path: &Path) -> PathBuf {
	if path.is_absolute() {
		return path.to_path_buf();
	}
	std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
}

/// Parse `NAME=PATH[:QUOTA]` as given to `combox init --node`
pub fn parse_node_spec(spec: &str) -> Result<NodeConfig> {
	let (name, rest) = spec
		.split_once('=')
		.ok_or_else(|| ComboxError::config(format!("expected NAME=PATH[:QUOTA], got {}", spec)))?;
	let (path, quota) = match rest.rsplit_once(':') {
		Some((p, q)) if !q.is_empty() && q.bytes().all(|b| b.is_ascii_digit()) => {
			let quota = q
				.parse()
				.map_err(|_| ComboxError::config(format!("invalid quota in {}", spec)))?;
			(p, quota)
		}
		_ => (rest, 0),
	};
	if name.is_empty() || path.is_empty() {
		return Err(ComboxError::config(format!("expected NAME=PATH[:QUOTA], got {}", spec)));
	}
	Ok(NodeConfig { name: name.to_string(), path: PathBuf::from(path), size_quota_mib: quota })
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn sample() -> Config {
		Config {
			combox_dir: PathBuf::from("/home/u/combox"),
			metadata_dir: PathBuf::from("/home/u/.combox"),
			passphrase: "topsecret".to_string(),
			nodes: vec![
				NodeConfig {
					name: "gdrive".to_string(),
					path: PathBuf::from("/mnt/gdrive/combox"),
					size_quota_mib: 1024,
				},
				NodeConfig {
					name: "dbox".to_string(),
					path: PathBuf::from("/mnt/dbox/combox"),
					size_quota_mib: 1024,
				},
			],
			..Config::default()
		}
	}

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.file_delete_delay(), Duration::from_secs(3));
		assert_eq!(config.dir_delete_delay(), Duration::from_secs(15));
		assert_eq!(config.settle_bytes_per_sec, 30 * MIB);
		assert_eq!(config.temp_patterns.len(), 3);
	}

	#[test]
	fn test_node_paths_sorted() {
		let config = sample();
		assert_eq!(
			config.node_paths(),
			vec![PathBuf::from("/mnt/dbox/combox"), PathBuf::from("/mnt/gdrive/combox")]
		);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_validate_rejects() {
		let mut config = sample();
		config.nodes.clear();
		assert!(config.validate().unwrap_err().to_string().contains("at least one node"));

		let mut config = sample();
		config.passphrase.clear();
		assert!(config.validate().is_err());

		let mut config = sample();
		config.nodes[1].path = PathBuf::from("/home/u/combox/inner");
		assert!(config.validate().unwrap_err().to_string().contains("overlaps"));

		let mut config = sample();
		config.nodes[1].path = config.nodes[0].path.clone();
		assert!(config.validate().unwrap_err().to_string().contains("twice"));
	}

	#[test]
	fn test_save_and_load() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("config.toml");
		let config = sample();
		config.save(&path).unwrap();

		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("comboxDirectory"));
		assert!(text.contains("sizeQuotaMiB"));

		let loaded = Config::load(&path).unwrap();
		assert_eq!(loaded.combox_dir, config.combox_dir);
		assert_eq!(loaded.nodes, config.nodes);
	}

	#[test]
	fn test_partial_file_uses_defaults() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("config.toml");
		fs::write(
			&path,
			"comboxDirectory = \"/c\"\nmetadataDirectory = \"/m\"\npassphrase = \"p\"\n\n[[nodes]]\nname = \"a\"\npath = \"/n/a\"\n",
		)
		.unwrap();
		let loaded = Config::load(&path).unwrap();
		assert_eq!(loaded.nodes[0].size_quota_mib, 0);
		assert_eq!(loaded.dir_delete_retries, 4);
	}

	#[test]
	fn test_parse_node_spec() {
		let node = parse_node_spec("dbox=/mnt/dbox/combox:2048").unwrap();
		assert_eq!(node.name, "dbox");
		assert_eq!(node.path, PathBuf::from("/mnt/dbox/combox"));
		assert_eq!(node.size_quota_mib, 2048);

		let node = parse_node_spec("gdrive=/mnt/g").unwrap();
		assert_eq!(node.size_quota_mib, 0);

		assert!(parse_node_spec("nopath").is_err());
		assert!(parse_node_spec("=/x").is_err());
	}
}

// vim: ts=4
