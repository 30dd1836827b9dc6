//! Filesystem events and the handler interface implemented by both monitors

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
	Created(PathBuf),
	Modified(PathBuf),
	Deleted(PathBuf),
	Moved { from: PathBuf, to: PathBuf },
}

/// One notification from a watched root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
	pub kind: EventKind,
	pub is_dir: bool,
}

impl FsEvent {
	pub fn created(path: impl Into<PathBuf>, is_dir: bool) -> Self {
		FsEvent { kind: EventKind::Created(path.into()), is_dir }
	}

	pub fn modified(path: impl Into<PathBuf>, is_dir: bool) -> Self {
		FsEvent { kind: EventKind::Modified(path.into()), is_dir }
	}

	pub fn deleted(path: impl Into<PathBuf>, is_dir: bool) -> Self {
		FsEvent { kind: EventKind::Deleted(path.into()), is_dir }
	}

	pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>, is_dir: bool) -> Self {
		FsEvent { kind: EventKind::Moved { from: from.into(), to: to.into() }, is_dir }
	}
}

impl fmt::Display for FsEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let tp = if self.is_dir { "directory" } else { "file" };
		match &self.kind {
			EventKind::Created(p) => write!(f, "created {} {}", tp, p.display()),
			EventKind::Modified(p) => write!(f, "modified {} {}", tp, p.display()),
			EventKind::Deleted(p) => write!(f, "deleted {} {}", tp, p.display()),
			EventKind::Moved { from, to } => {
				write!(f, "moved {} {} -> {}", tp, from.display(), to.display())
			}
		}
	}
}

/// Reaction to events delivered for one watched root
pub trait EventHandler: Send + Sync {
	fn on_created(&self, path: &Path, is_dir: bool) -> Result<()>;

	fn on_modified(&self, path: &Path, is_dir: bool) -> Result<()>;

	fn on_deleted(&self, path: &Path, is_dir: bool) -> Result<()>;

	fn on_moved(&self, from: &Path, to: &Path, is_dir: bool) -> Result<()>;

	fn dispatch(&self, event: &FsEvent) -> Result<()> {
		match &event.kind {
			EventKind::Created(p) => self.on_created(p, event.is_dir),
			EventKind::Modified(p) => self.on_modified(p, event.is_dir),
			EventKind::Deleted(p) => self.on_deleted(p, event.is_dir),
			EventKind::Moved { from, to } => self.on_moved(from, to, event.is_dir),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	struct Recorder {
		seen: Mutex<Vec<String>>,
	}

	impl EventHandler for Recorder {
		fn on_created(&self, path: &Path, _is_dir: bool) -> Result<()> {
			self.seen.lock().unwrap().push(format!("c {}", path.display()));
			Ok(())
		}
		fn on_modified(&self, path: &Path, _is_dir: bool) -> Result<()> {
			self.seen.lock().unwrap().push(format!("m {}", path.display()));
			Ok(())
		}
		fn on_deleted(&self, path: &Path, _is_dir: bool) -> Result<()> {
			self.seen.lock().unwrap().push(format!("d {}", path.display()));
			Ok(())
		}
		fn on_moved(&self, from: &Path, to: &Path, _is_dir: bool) -> Result<()> {
			self.seen.lock().unwrap().push(format!("v {} {}", from.display(), to.display()));
			Ok(())
		}
	}

	#[test]
	fn test_dispatch_routes_by_kind() {
		let r = Recorder::default();
		r.dispatch(&FsEvent::created("/a", false)).unwrap();
		r.dispatch(&FsEvent::modified("/a", false)).unwrap();
		r.dispatch(&FsEvent::moved("/a", "/b", false)).unwrap();
		r.dispatch(&FsEvent::deleted("/b", true)).unwrap();
		assert_eq!(*r.seen.lock().unwrap(), vec!["c /a", "m /a", "v /a /b", "d /b"]);
	}

	#[test]
	fn test_display() {
		let ev = FsEvent::moved("/x/a", "/x/b", true);
		assert_eq!(ev.to_string(), "moved directory /x/a -> /x/b");
	}
}

// vim: ts=4
