//! Mapping between the combox directory and node directories
//!
//! A file `<combox>/a/b.txt` is stored as `<node K>/a/b.txt.shard<K>` on the
//! K-th node (nodes sorted by path). Directories are mirrored as-is.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};

use crate::error::{ComboxError, Result};

const SHARD_MARK: &str = ".shard";

/// Split `name` into (base, index) if it ends in `.shard<digits>`
fn parse_shard_name(name: &str) -> Option<(&str, usize)> {
	let pos = name.rfind(SHARD_MARK)?;
	let digits = &name[pos + SHARD_MARK.len()..];
	if pos == 0 || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	digits.parse().ok().map(|idx| (&name[..pos], idx))
}

/// True iff the final path component matches `*.shard<digits>`
pub fn is_shard(path: &Path) -> bool {
	shard_index(path).is_some()
}

/// Node index encoded in a shard file name
pub fn shard_index(path: &Path) -> Option<usize> {
	path.file_name().and_then(|n| n.to_str()).and_then(parse_shard_name).map(|(_, idx)| idx)
}

/// Silo key for a relative path: components joined with '/'
pub fn key_of(rel: &Path) -> String {
	rel.components()
		.filter_map(|c| match c {
			Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
			_ => None,
		})
		.collect::<Vec<_>>()
		.join("/")
}

/// Bidirectional translation between canonical and node paths
#[derive(Debug, Clone)]
pub struct PathMapper {
	combox_dir: PathBuf,
	nodes: Vec<PathBuf>,
}

impl PathMapper {
	/// Node paths are sorted here; the order fixes each node's shard index.
	pub fn new(combox_dir: impl Into<PathBuf>, nodes: Vec<PathBuf>) -> Self {
		let mut nodes = nodes;
		nodes.sort();
		nodes.dedup();
		PathMapper { combox_dir: combox_dir.into(), nodes }
	}

	pub fn combox_dir(&self) -> &Path {
		&self.combox_dir
	}

	pub fn nodes(&self) -> &[PathBuf] {
		&self.nodes
	}

	pub fn num_nodes(&self) -> usize {
		self.nodes.len()
	}

	/// Index of the node directory `path` lives in
	pub fn node_index(&self, path: &Path) -> Option<usize> {
		// Longest match wins when node directories share a prefix
		self.nodes
			.iter()
			.enumerate()
			.filter(|(_, node)| path.starts_with(node))
			.max_by_key(|(_, node)| node.as_os_str().len())
			.map(|(i, _)| i)
	}

	/// `<node>/<rel>.shard<K>` for files, `<node>/<rel>` for directories
	pub fn to_node_path(&self, canonical: &Path, node: usize, is_dir: bool) -> Result<PathBuf> {
		let node_dir = self
			.nodes
			.get(node)
			.ok_or_else(|| ComboxError::invalid_path(canonical, format!("no node {}", node)))?;
		let rel = canonical.strip_prefix(&self.combox_dir).map_err(|_| {
			ComboxError::invalid_path(canonical, "not under the combox directory")
		})?;
		if is_dir {
			return Ok(node_dir.join(rel));
		}
		if rel.as_os_str().is_empty() {
			return Err(ComboxError::invalid_path(canonical, "combox root is not a file"));
		}
		let mut shard = node_dir.join(rel).into_os_string();
		shard.push(format!("{}{}", SHARD_MARK, node));
		Ok(PathBuf::from(shard))
	}

	/// Shard path of `canonical` on every node, in node order
	pub fn shard_paths(&self, canonical: &Path) -> Result<Vec<PathBuf>> {
		(0..self.nodes.len()).map(|i| self.to_node_path(canonical, i, false)).collect()
	}

	/// Mirrored directory of `canonical` on every node, in node order
	pub fn dir_paths(&self, canonical: &Path) -> Result<Vec<PathBuf>> {
		(0..self.nodes.len()).map(|i| self.to_node_path(canonical, i, true)).collect()
	}

	/// Strip the node prefix and any `.shard<digits>` suffix
	pub fn to_canonical(&self, node_path: &Path) -> Result<PathBuf> {
		let idx = self.node_index(node_path).ok_or_else(|| {
			ComboxError::invalid_path(node_path, "not under any node directory")
		})?;
		let rel = node_path
			.strip_prefix(&self.nodes[idx])
			.map_err(|_| ComboxError::invalid_path(node_path, "not under any node directory"))?;

		let mut canonical = self.combox_dir.join(rel);
		let base = node_path
			.file_name()
			.and_then(|n| n.to_str())
			.and_then(parse_shard_name)
			.map(|(base, _)| base.to_string());
		if let Some(base) = base {
			canonical.set_file_name(base);
		}
		Ok(canonical)
	}

	/// Silo key of a canonical path
	pub fn key(&self, canonical: &Path) -> Result<String> {
		let rel = canonical.strip_prefix(&self.combox_dir).map_err(|_| {
			ComboxError::invalid_path(canonical, "not under the combox directory")
		})?;
		Ok(key_of(rel))
	}

	/// Canonical path of a silo key
	pub fn from_key(&self, key: &str) -> PathBuf {
		key.split('/').fold(self.combox_dir.clone(), |p, c| p.join(c))
	}
}

/// Glob matcher over a single file name or path component
#[derive(Debug, Clone)]
pub struct NameMatcher {
	set: GlobSet,
}

impl NameMatcher {
	pub fn new(patterns: &[String]) -> Result<Self> {
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let glob = Glob::new(pattern)
				.map_err(|e| ComboxError::config(format!("{}: {}", pattern, e)))?;
			builder.add(glob);
		}
		let set = builder
			.build()
			.map_err(|e| ComboxError::config(format!("Failed to build pattern set: {}", e)))?;
		Ok(NameMatcher { set })
	}

	/// Final component matches
	pub fn matches_name(&self, path: &Path) -> bool {
		path.file_name().map(|n| self.set.is_match(Path::new(n))).unwrap_or(false)
	}

	/// Any component matches
	pub fn matches_component(&self, path: &Path) -> bool {
		path.components().any(|c| match c {
			Component::Normal(s) => self.set.is_match(Path::new(s)),
			_ => false,
		})
	}
}

pub fn default_temp_patterns() -> Vec<String> {
	vec!["*~".to_string(), ".#*".to_string(), "#*#".to_string()]
}

pub fn default_agent_cache_patterns() -> Vec<String> {
	vec![".dropbox.cache".to_string()]
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mapper() -> PathMapper {
		PathMapper::new(
			"/home/u/combox",
			vec![PathBuf::from("/mnt/dropbox/combox"), PathBuf::from("/mnt/drive/combox")],
		)
	}

	#[test]
	fn test_nodes_sorted() {
		let m = mapper();
		assert_eq!(m.nodes()[0], PathBuf::from("/mnt/drive/combox"));
		assert_eq!(m.nodes()[1], PathBuf::from("/mnt/dropbox/combox"));
		assert_eq!(m.num_nodes(), 2);
	}

	#[test]
	fn test_shard_predicate() {
		assert!(is_shard(Path::new("/x/a.txt.shard0")));
		assert!(is_shard(Path::new("a.shard12")));
		assert!(!is_shard(Path::new("a.txt.shard")));
		assert!(!is_shard(Path::new("a.txt.shardx")));
		assert!(!is_shard(Path::new(".shard1")));
		assert!(!is_shard(Path::new("/x/a.shard0/b.txt")));
		assert_eq!(shard_index(Path::new("a.txt.shard3")), Some(3));
	}

	#[test]
	fn test_to_node_path() {
		let m = mapper();
		let file = Path::new("/home/u/combox/docs/a.txt");
		assert_eq!(
			m.to_node_path(file, 1, false).unwrap(),
			PathBuf::from("/mnt/dropbox/combox/docs/a.txt.shard1")
		);
		assert_eq!(
			m.to_node_path(Path::new("/home/u/combox/docs"), 0, true).unwrap(),
			PathBuf::from("/mnt/drive/combox/docs")
		);
		assert!(m.to_node_path(file, 2, false).is_err());
		assert!(m.to_node_path(Path::new("/etc/passwd"), 0, false).is_err());
	}

	#[test]
	fn test_to_canonical() {
		let m = mapper();
		assert_eq!(
			m.to_canonical(Path::new("/mnt/drive/combox/docs/a.txt.shard0")).unwrap(),
			PathBuf::from("/home/u/combox/docs/a.txt")
		);
		assert_eq!(
			m.to_canonical(Path::new("/mnt/dropbox/combox/docs")).unwrap(),
			PathBuf::from("/home/u/combox/docs")
		);
		let err = m.to_canonical(Path::new("/tmp/a.txt.shard0")).unwrap_err();
		assert!(matches!(err, ComboxError::InvalidPath { .. }));
	}

	#[test]
	fn test_keys() {
		let m = mapper();
		assert_eq!(m.key(Path::new("/home/u/combox/docs/a.txt")).unwrap(), "docs/a.txt");
		assert_eq!(m.from_key("docs/a.txt"), PathBuf::from("/home/u/combox/docs/a.txt"));
		assert!(m.key(Path::new("/var/x")).is_err());
	}

	#[test]
	fn test_shard_paths_in_node_order() {
		let m = mapper();
		let shards = m.shard_paths(Path::new("/home/u/combox/a")).unwrap();
		assert_eq!(
			shards,
			vec![
				PathBuf::from("/mnt/drive/combox/a.shard0"),
				PathBuf::from("/mnt/dropbox/combox/a.shard1"),
			]
		);
	}

	#[test]
	fn test_temp_matcher() {
		let m = NameMatcher::new(&default_temp_patterns()).unwrap();
		assert!(m.matches_name(Path::new("/c/notes.txt~")));
		assert!(m.matches_name(Path::new("/c/.#notes.txt")));
		assert!(m.matches_name(Path::new("/c/#notes.txt#")));
		assert!(!m.matches_name(Path::new("/c/notes.txt")));
	}

	#[test]
	fn test_agent_cache_matcher() {
		let m = NameMatcher::new(&default_agent_cache_patterns()).unwrap();
		assert!(m.matches_component(Path::new("/mnt/dropbox/.dropbox.cache/2024/a.txt.shard1")));
		assert!(!m.matches_component(Path::new("/mnt/dropbox/combox/a.txt.shard1")));
	}
}

// vim: ts=4
