//! Recursive directory watching
//!
//! Each watched root gets a notify watcher feeding a channel and one thread
//! that translates raw notifications into [`FsEvent`]s and hands them to the
//! root's handler, one at a time.

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{ComboxError, Result};
use crate::events::{EventHandler, FsEvent};

/// How long an unpaired rename source may wait for its destination
const RENAME_PAIR_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Translation
// ============================================================================

/// Turns raw notify events into [`FsEvent`]s.
///
/// Renames arrive in pieces: a source half, a destination half and, on some
/// backends, a combined event. Halves are paired by their tracker. A source
/// that never finds its destination (moved out of the tree) becomes a delete;
/// a destination without a source (moved in) becomes a create.
#[derive(Debug)]
pub struct EventTranslator {
	root: PathBuf,
	pending_from: Vec<(usize, PathBuf)>,
	paired: HashSet<usize>,
}

impl EventTranslator {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		EventTranslator { root: root.into(), pending_from: Vec::new(), paired: HashSet::new() }
	}

	pub fn has_pending(&self) -> bool {
		!self.pending_from.is_empty()
	}

	/// Unpaired rename sources, reported as deletes
	pub fn flush(&mut self) -> Vec<FsEvent> {
		self.paired.clear();
		self.pending_from.drain(..).map(|(_, path)| FsEvent::deleted(path, false)).collect()
	}

	pub fn translate(&mut self, event: notify::Event) -> Vec<FsEvent> {
		let tracker = event.attrs.tracker();
		let mut out = Vec::new();

		let is_rename_half = matches!(
			event.kind,
			notify::EventKind::Modify(ModifyKind::Name(RenameMode::To))
				| notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both))
		);
		if !is_rename_half {
			out.extend(self.flush());
		}

		let paths: Vec<PathBuf> = event.paths.into_iter().filter(|p| *p != self.root).collect();
		match event.kind {
			notify::EventKind::Create(kind) => {
				for path in paths {
					let is_dir = match kind {
						CreateKind::Folder => true,
						CreateKind::File => false,
						_ => path.is_dir(),
					};
					out.push(FsEvent::created(path, is_dir));
				}
			}
			notify::EventKind::Remove(kind) => {
				for path in paths {
					out.push(FsEvent::deleted(path, kind == RemoveKind::Folder));
				}
			}
			notify::EventKind::Modify(ModifyKind::Name(mode)) => self.rename(mode, tracker, paths, &mut out),
			notify::EventKind::Modify(ModifyKind::Metadata(_)) => {}
			notify::EventKind::Modify(_) => {
				for path in paths {
					let is_dir = path.is_dir();
					out.push(FsEvent::modified(path, is_dir));
				}
			}
			notify::EventKind::Access(_) | notify::EventKind::Any | notify::EventKind::Other => {}
		}
		out
	}

	fn rename(&mut self, mode: RenameMode, tracker: Option<usize>, paths: Vec<PathBuf>, out: &mut Vec<FsEvent>) {
		match (mode, tracker) {
			(RenameMode::From, Some(t)) => {
				for path in paths {
					self.pending_from.push((t, path));
				}
			}
			(RenameMode::To, Some(t)) => {
				for to in paths {
					if self.paired.remove(&t) {
						continue;
					}
					match self.take_pending(t) {
						Some(from) => {
							self.paired.insert(t);
							let is_dir = to.is_dir();
							out.push(FsEvent::moved(from, to, is_dir));
						}
						None => {
							let is_dir = to.is_dir();
							out.push(FsEvent::created(to, is_dir));
						}
					}
				}
			}
			(RenameMode::Both, t) if paths.len() == 2 => {
				if let Some(t) = t {
					if self.paired.remove(&t) {
						return;
					}
					self.take_pending(t);
					self.paired.insert(t);
				}
				let mut it = paths.into_iter();
				if let (Some(from), Some(to)) = (it.next(), it.next()) {
					let is_dir = to.is_dir();
					out.push(FsEvent::moved(from, to, is_dir));
				}
			}
			// No way to pair: look at what is on disk now
			_ => {
				for path in paths {
					if path.exists() {
						let is_dir = path.is_dir();
						out.push(FsEvent::created(path, is_dir));
					} else {
						out.push(FsEvent::deleted(path, false));
					}
				}
			}
		}
	}

	fn take_pending(&mut self, tracker: usize) -> Option<PathBuf> {
		let idx = self.pending_from.iter().position(|(t, _)| *t == tracker)?;
		Some(self.pending_from.remove(idx).1)
	}
}

// ============================================================================
// Watch threads
// ============================================================================

/// A running watch on one root. Dropping it without `stop_and_join` leaves
/// the thread to exit on its own once the watcher is gone.
pub struct WatchHandle {
	name: String,
	watcher: Option<RecommendedWatcher>,
	stop: Arc<AtomicBool>,
	thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Stop delivering events and wait for the handler thread. An event being
	/// handled is finished first.
	pub fn stop_and_join(mut self) {
		self.stop.store(true, Ordering::SeqCst);
		// Dropping the watcher closes the channel
		self.watcher.take();
		if let Some(thread) = self.thread.take() {
			if thread.join().is_err() {
				error!("Watch thread {} panicked", self.name);
			}
		}
		info!("Stopped watching {}", self.name);
	}
}

/// Watch `root` recursively and deliver its events to `handler` on a
/// dedicated thread
pub fn spawn(name: &str, root: &Path, handler: Arc<dyn EventHandler>) -> Result<WatchHandle> {
	let (tx, rx) = mpsc::channel();
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
		let _ = tx.send(res);
	})
	.map_err(|e| ComboxError::Watch { path: root.to_path_buf(), message: e.to_string() })?;
	watcher
		.watch(root, RecursiveMode::Recursive)
		.map_err(|e| ComboxError::Watch { path: root.to_path_buf(), message: e.to_string() })?;

	let stop = Arc::new(AtomicBool::new(false));
	let thread_stop = stop.clone();
	let thread_name = name.to_string();
	let translator = EventTranslator::new(root);
	let thread = std::thread::Builder::new()
		.name(format!("watch-{}", name))
		.spawn(move || event_loop(&thread_name, rx, translator, handler.as_ref(), &thread_stop))
		.map_err(|e| ComboxError::Watch { path: root.to_path_buf(), message: e.to_string() })?;

	info!("Watching {} ({})", root.display(), name);
	Ok(WatchHandle { name: name.to_string(), watcher: Some(watcher), stop, thread: Some(thread) })
}

fn event_loop(
	name: &str,
	rx: mpsc::Receiver<notify::Result<notify::Event>>,
	mut translator: EventTranslator,
	handler: &dyn EventHandler,
	stop: &AtomicBool,
) {
	loop {
		if stop.load(Ordering::SeqCst) {
			break;
		}
		let events = match rx.recv_timeout(RENAME_PAIR_TIMEOUT) {
			Ok(Ok(event)) => translator.translate(event),
			Ok(Err(e)) => {
				warn!("{}: watch error: {}", name, e);
				continue;
			}
			Err(mpsc::RecvTimeoutError::Timeout) => {
				if !translator.has_pending() {
					continue;
				}
				translator.flush()
			}
			Err(mpsc::RecvTimeoutError::Disconnected) => break,
		};
		for event in events {
			if stop.load(Ordering::SeqCst) {
				break;
			}
			deliver(name, handler, &event);
		}
	}
	debug!("{}: event loop exiting", name);
}

fn deliver(name: &str, handler: &dyn EventHandler, event: &FsEvent) {
	debug!("{}: {}", name, event);
	match handler.dispatch(event) {
		Ok(()) => {}
		// Raced with a later change; the next event covers it
		Err(e) if e.is_not_found() => debug!("{}: {} ({})", name, e, event),
		Err(e) => error!("{}: failed to handle {}: {}", name, event, e),
	}
}


// vim: ts=4
