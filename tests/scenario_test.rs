/// End-to-end scenarios: monitors driven through their event handlers on real
/// temporary directories, with a fake clock for the deferred work.
///
/// Covers:
/// 1. Local create, delete and rename reaching every node
/// 2. Remote creation, modification and deletion gated by the quorum
/// 3. Directory creation mirrored both ways
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use combox::codec;
use combox::config::{Config, NodeConfig};
use combox::events::{EventHandler, FsEvent};
use combox::runner::{self, Monitors};
use combox::scheduler::ManualScheduler;
use combox::silo::{CounterKind, Silo};

const PASS: &[u8] = b"topsecret";

struct Harness {
	_tmp: TempDir,
	sched: Arc<ManualScheduler>,
	monitors: Monitors,
}

impl Harness {
	fn new(n: usize) -> Self {
		let tmp = TempDir::new().unwrap();
		let config = Config {
			combox_dir: tmp.path().join("combox"),
			metadata_dir: tmp.path().join("meta"),
			passphrase: "topsecret".to_string(),
			nodes: (0..n)
				.map(|i| NodeConfig {
					name: format!("provider{}", i),
					path: tmp.path().join(format!("node{}", i)),
					size_quota_mib: 0,
				})
				.collect(),
			..Config::default()
		};
		runner::prepare_dirs(&config).unwrap();
		let silo = runner::open_silo(&config).unwrap();
		let sched = Arc::new(ManualScheduler::new());
		let monitors = Monitors::new(&config, silo, sched.clone()).unwrap();
		Harness { _tmp: tmp, sched, monitors }
	}

	fn n(&self) -> usize {
		self.monitors.nodes.len()
	}

	fn silo(&self) -> &Silo {
		&self.monitors.context().silo
	}

	fn canonical(&self, name: &str) -> PathBuf {
		self.monitors.context().mapper.combox_dir().join(name)
	}

	fn shard(&self, name: &str, node: usize) -> PathBuf {
		self.monitors.context().mapper.to_node_path(&self.canonical(name), node, false).unwrap()
	}

	fn node_dir(&self, name: &str, node: usize) -> PathBuf {
		self.monitors.context().mapper.to_node_path(&self.canonical(name), node, true).unwrap()
	}

	fn shard_count(&self, name: &str) -> usize {
		(0..self.n()).filter(|&k| self.shard(name, k).is_file()).count()
	}

	/// Create a canonical file and report it to the combox monitor
	fn local_create(&self, name: &str, data: &[u8]) {
		let path = self.canonical(name);
		fs::write(&path, data).unwrap();
		self.monitors.combox.dispatch(&FsEvent::created(path, false)).unwrap();
	}

	/// Write shard `node` of `data` as that node's sync agent would
	fn arrive(&self, name: &str, node: usize, data: &[u8]) {
		let shard = self.shard(name, node);
		fs::create_dir_all(shard.parent().unwrap()).unwrap();
		let existed = shard.exists();
		fs::write(&shard, &codec::encode(data, self.n(), PASS)[node]).unwrap();
		let event =
			if existed { FsEvent::modified(shard, false) } else { FsEvent::created(shard, false) };
		self.monitors.nodes[node].dispatch(&event).unwrap();
	}
}

fn content(len: usize) -> Vec<u8> {
	(0..len).map(|i| b"abcdefghij"[i % 10]).collect()
}

// ===================================================================
// LOCAL CHANGES
// ===================================================================

#[test]
fn test_new_file_is_sharded_to_every_node() {
	let h = Harness::new(3);
	let data = content(10_000);
	h.local_create("big.bin", &data);

	let parts = codec::split(&data, 3);
	let mut decrypted = Vec::new();
	for k in 0..3 {
		let text = fs::read(h.shard("big.bin", k)).unwrap();
		let plain = codec::decrypt(&text, PASS).unwrap();
		assert_eq!(plain, parts[k], "shard {} holds range {}", k, k);
		decrypted.push(plain);
	}
	assert_eq!(codec::glue(&decrypted), data);
	assert_eq!(h.silo().get("big.bin").unwrap(), Some(codec::hash_bytes(&data)));
}

#[test]
fn test_local_delete_removes_shards_and_key() {
	let h = Harness::new(3);
	h.local_create("a.txt", b"short lived");
	assert_eq!(h.shard_count("a.txt"), 3);

	fs::remove_file(h.canonical("a.txt")).unwrap();
	h.monitors.combox.dispatch(&FsEvent::deleted(h.canonical("a.txt"), false)).unwrap();
	assert_eq!(h.shard_count("a.txt"), 0);
	assert!(!h.silo().contains("a.txt").unwrap());
}

#[test]
fn test_local_rename_moves_shards_and_key() {
	let h = Harness::new(3);
	h.local_create("old.txt", b"renamed content");
	let hash = h.silo().get("old.txt").unwrap();

	fs::rename(h.canonical("old.txt"), h.canonical("new.txt")).unwrap();
	h.monitors
		.combox
		.dispatch(&FsEvent::moved(h.canonical("old.txt"), h.canonical("new.txt"), false))
		.unwrap();

	assert_eq!(h.shard_count("old.txt"), 0);
	assert_eq!(h.shard_count("new.txt"), 3);
	assert_eq!(h.silo().get("old.txt").unwrap(), None);
	assert_eq!(h.silo().get("new.txt").unwrap(), hash);
}

// ===================================================================
// REMOTE CHANGES
// ===================================================================

#[test]
fn test_remote_creation_reconstructs_once() {
	let h = Harness::new(3);
	let data = content(1234);

	for k in 0..3 {
		assert!(!h.canonical("remote.txt").exists());
		h.arrive("remote.txt", k, &data);
	}
	assert_eq!(fs::read(h.canonical("remote.txt")).unwrap(), data);
	assert_eq!(h.silo().get("remote.txt").unwrap(), Some(codec::hash_bytes(&data)));
	assert_eq!(h.silo().counter_get(CounterKind::Created, "remote.txt").unwrap(), None);

	// The combox monitor sees the reconstruction and must not re-shard
	let before: Vec<Vec<u8>> = (0..3).map(|k| fs::read(h.shard("remote.txt", k)).unwrap()).collect();
	h.monitors.combox.dispatch(&FsEvent::created(h.canonical("remote.txt"), false)).unwrap();
	let after: Vec<Vec<u8>> = (0..3).map(|k| fs::read(h.shard("remote.txt", k)).unwrap()).collect();
	assert_eq!(before, after);
}

#[test]
fn test_partial_remote_creation_waits() {
	let h = Harness::new(3);
	let data = content(500);
	h.arrive("partial.txt", 0, &data);
	h.arrive("partial.txt", 2, &data);

	assert!(!h.canonical("partial.txt").exists());
	assert_eq!(h.silo().counter_get(CounterKind::Created, "partial.txt").unwrap(), Some(2));
	assert!(!h.silo().contains("partial.txt").unwrap());
}

#[test]
fn test_remote_modification_needs_every_node() {
	let h = Harness::new(2);
	h.local_create("doc.txt", b"first draft");

	h.arrive("doc.txt", 0, b"second draft");
	assert_eq!(fs::read(h.canonical("doc.txt")).unwrap(), b"first draft".to_vec());
	assert_eq!(h.silo().counter_get(CounterKind::Modified, "doc.txt").unwrap(), Some(1));

	h.arrive("doc.txt", 1, b"second draft");
	assert_eq!(fs::read(h.canonical("doc.txt")).unwrap(), b"second draft".to_vec());
	assert_eq!(h.silo().counter_get(CounterKind::Modified, "doc.txt").unwrap(), None);
	assert_eq!(h.silo().get("doc.txt").unwrap(), Some(codec::hash_bytes(b"second draft")));
}

#[test]
fn test_repeated_events_from_one_node_count_once() {
	let h = Harness::new(2);
	h.local_create("doc.txt", b"first draft, old old");

	// One rewrite of one shard, reported several times
	h.arrive("doc.txt", 0, b"second draft, NEW NEW");
	for _ in 0..3 {
		h.monitors.nodes[0].dispatch(&FsEvent::modified(h.shard("doc.txt", 0), false)).unwrap();
	}
	assert_eq!(fs::read(h.canonical("doc.txt")).unwrap(), b"first draft, old old".to_vec());
	assert_eq!(h.silo().counter_get(CounterKind::Modified, "doc.txt").unwrap(), Some(1));

	// The same rename reported twice by node 1
	h.local_create("old.txt", b"stays put");
	let from = h.shard("old.txt", 1);
	let to = h.shard("new.txt", 1);
	fs::rename(&from, &to).unwrap();
	for _ in 0..2 {
		h.monitors.nodes[1].dispatch(&FsEvent::moved(&from, &to, false)).unwrap();
	}
	assert!(h.canonical("old.txt").exists());
	assert!(!h.canonical("new.txt").exists());
	assert_eq!(h.silo().counter_get(CounterKind::Moved, "old.txt").unwrap(), Some(1));

	// The other node completes both quorums
	h.arrive("doc.txt", 1, b"second draft, NEW NEW");
	assert_eq!(fs::read(h.canonical("doc.txt")).unwrap(), b"second draft, NEW NEW".to_vec());
}

#[test]
fn test_remote_deletion_is_deferred() {
	let h = Harness::new(3);
	h.local_create("gone.txt", b"to be removed remotely");

	for k in 0..3 {
		let shard = h.shard("gone.txt", k);
		fs::remove_file(&shard).unwrap();
		h.monitors.nodes[k].dispatch(&FsEvent::deleted(shard, false)).unwrap();
	}
	assert!(h.canonical("gone.txt").exists());
	assert_eq!(h.silo().counter_get(CounterKind::Deleted, "gone.txt").unwrap(), Some(3));

	h.sched.advance(Duration::from_secs(2));
	assert!(h.canonical("gone.txt").exists());
	h.sched.advance(Duration::from_secs(1));
	assert!(!h.canonical("gone.txt").exists());
	assert!(!h.silo().contains("gone.txt").unwrap());
	assert_eq!(h.silo().counter_get(CounterKind::Deleted, "gone.txt").unwrap(), None);

	// The combox monitor's own delete event is then a no-op
	h.monitors.combox.dispatch(&FsEvent::deleted(h.canonical("gone.txt"), false)).unwrap();
}

#[test]
fn test_partial_remote_deletion_keeps_file() {
	let h = Harness::new(3);
	h.local_create("kept.txt", b"still here");

	let shard = h.shard("kept.txt", 1);
	fs::remove_file(&shard).unwrap();
	h.monitors.nodes[1].dispatch(&FsEvent::deleted(shard, false)).unwrap();

	h.sched.advance(Duration::from_secs(60));
	assert!(h.canonical("kept.txt").exists());
	assert_eq!(h.silo().counter_get(CounterKind::Deleted, "kept.txt").unwrap(), Some(1));
}

// ===================================================================
// DIRECTORIES
// ===================================================================

#[test]
fn test_directories_mirror_both_ways() {
	let h = Harness::new(2);

	fs::create_dir(h.canonical("local")).unwrap();
	h.monitors.combox.dispatch(&FsEvent::created(h.canonical("local"), true)).unwrap();
	assert!(h.node_dir("local", 0).is_dir());
	assert!(h.node_dir("local", 1).is_dir());

	for k in 0..2 {
		let dir = h.node_dir("remote", k);
		fs::create_dir(&dir).unwrap();
		h.monitors.nodes[k].dispatch(&FsEvent::created(dir, true)).unwrap();
	}
	assert!(h.canonical("remote").is_dir());
	assert_eq!(h.silo().counter_get(CounterKind::Created, "remote").unwrap(), None);
}

#[test]
fn test_remote_directory_rename() {
	let h = Harness::new(2);
	fs::create_dir(h.canonical("photos")).unwrap();
	h.monitors.combox.dispatch(&FsEvent::created(h.canonical("photos"), true)).unwrap();
	h.local_create("photos/cat.jpg", b"meow");

	for k in 0..2 {
		let from = h.node_dir("photos", k);
		let to = h.node_dir("pictures", k);
		fs::rename(&from, &to).unwrap();
		h.monitors.nodes[k].dispatch(&FsEvent::moved(from, to, true)).unwrap();
	}
	assert!(!h.canonical("photos").exists());
	assert_eq!(fs::read(h.canonical("pictures/cat.jpg")).unwrap(), b"meow".to_vec());
	assert_eq!(h.silo().keys().unwrap(), vec!["pictures/cat.jpg".to_string()]);
}
