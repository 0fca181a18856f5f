//! Watcher backend based on kqueue (BSD, macOS).
//!
//! kqueue reports vnode-level changes on open file descriptors, one
//! descriptor per watched path. It has no notion of "a file appeared in this
//! directory", so member-level create events are synthesized: when a
//! directory is added, its members are enumerated into a remembered set and
//! each member gets an internal watch; when the kernel later reports a write
//! on the directory, the listing is diffed against the remembered set and
//! each previously-unseen member is emitted as a create.
//!
//! # Implementation details
//! One dedicated thread blocks in `kevent(2)` and is the sole sender on the
//! events and errors channels. Callers mutate the watch set from their own
//! threads; a single mutex serializes the index maps and is never held
//! across a kernel call, a filesystem call or a channel send. The read end
//! of a pipe is registered with the queue so that closing the write end
//! wakes the blocked thread without polling.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::{fs, thread};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::unistd::pipe2;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Error;
use crate::event::{Event, Op};
use crate::path;

/// Watch all events (except NOTE_EXTEND, NOTE_LINK, NOTE_REVOKE).
const NOTE_ALL_EVENTS: FilterFlag = FilterFlag::NOTE_DELETE
    .union(FilterFlag::NOTE_WRITE)
    .union(FilterFlag::NOTE_ATTRIB)
    .union(FilterFlag::NOTE_RENAME);

/// How many kevents to retrieve per `kevent(2)` call.
const EVENT_BATCH: usize = 10;

// O_EVTONLY is a descriptor for event notifications only; unlike O_RDONLY it
// does not prevent the volume from being unmounted. It only exists on Darwin.
#[cfg(target_os = "macos")]
const OPEN_FLAGS: i32 = libc::O_EVTONLY | libc::O_CLOEXEC;
#[cfg(not(target_os = "macos"))]
const OPEN_FLAGS: i32 = libc::O_NONBLOCK | libc::O_CLOEXEC;

pub(crate) struct Backend {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    kq: Kqueue,
    /// Write end of the shutdown pipe; taken and dropped by `close` to wake
    /// the reader out of `kevent(2)`.
    close_w: Mutex<Option<OwnedFd>>,
    /// Sender half of the `done` signal; taken and dropped by `close` so
    /// that an emission in flight is abandoned instead of blocking forever.
    done_tx: Mutex<Option<Sender<()>>>,
    state: Mutex<State>,
}

/// Index maps linking paths, descriptors and directory memberships.
#[derive(Default)]
struct State {
    closed: bool,
    /// Watched path -> raw descriptor.
    watches: FxHashMap<PathBuf, RawFd>,
    /// Raw descriptor -> watch entry (owns the descriptor).
    paths: FxHashMap<RawFd, WatchEntry>,
    /// Parent directory -> descriptors of the watches directly inside it.
    watches_by_dir: FxHashMap<PathBuf, FxHashSet<RawFd>>,
    /// Watched directory -> filter mask currently requested for it.
    dir_flags: FxHashMap<PathBuf, FilterFlag>,
    /// Paths registered through the public `add`, as opposed to the watches
    /// synthesized for directory members.
    user_watches: FxHashSet<PathBuf>,
    /// Members we know exist, to suppress duplicate synthetic creates.
    file_exists: FxHashSet<PathBuf>,
}

struct WatchEntry {
    /// Owns the kernel descriptor: dropping the entry closes it, exactly
    /// once, no matter how many threads race on `remove`.
    fd: OwnedFd,
    path: PathBuf,
    is_dir: bool,
}

impl Backend {
    pub(crate) fn new(event_tx: Sender<Event>, error_tx: Sender<Error>) -> Result<Self, Error> {
        let kq = Kqueue::new().map_err(into_io)?;

        // The pipe is the shutdown channel: its read end is registered with
        // the queue, so closing the write end delivers a readable event that
        // wakes the reader. Without it, kevent() would block forever.
        let (pipe_r, pipe_w) = pipe2(OFlag::O_CLOEXEC).map_err(into_io)?;
        let changes = [KEvent::new(
            pipe_r.as_raw_fd() as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE | EventFlag::EV_ONESHOT,
            FilterFlag::empty(),
            0,
            0,
        )];
        let mut out: [KEvent; 0] = [];
        kq.kevent(&changes, &mut out, None).map_err(into_io)?;

        let (done_tx, done_rx) = bounded::<()>(0);
        let shared = Arc::new(Shared {
            kq,
            close_w: Mutex::new(Some(pipe_w)),
            done_tx: Mutex::new(Some(done_tx)),
            state: Mutex::new(State::default()),
        });

        let read_loop = ReadLoop {
            shared: Arc::clone(&shared),
            pipe_r,
            event_tx,
            error_tx,
            done_rx,
            closing: false,
        };
        let reader = thread::spawn(move || read_loop.run());

        Ok(Backend {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub(crate) fn add(&self, path: &Path) -> Result<(), Error> {
        if let Some(watched) = self.shared.add_watch(path, NOTE_ALL_EVENTS)? {
            let mut state = self.shared.state.lock().unwrap();
            if state.watches.contains_key(&watched) {
                state.user_watches.insert(watched);
            }
        }
        Ok(())
    }

    pub(crate) fn remove(&self, path: &Path) -> Result<(), Error> {
        self.shared.remove_watch(path)
    }

    pub(crate) fn watch_list(&self) -> Vec<PathBuf> {
        let state = self.shared.state.lock().unwrap();
        state.watches.keys().cloned().collect()
    }

    /// Removes all watches and shuts the reader down. Idempotent.
    pub(crate) fn close(&self) -> Result<(), Error> {
        let to_remove: Vec<PathBuf> = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.watches.keys().cloned().collect()
        };
        for p in &to_remove {
            let _ = self.shared.remove_watch(p);
        }

        // Fire `done` first so an emission in flight is abandoned, then wake
        // the reader out of the kernel wait.
        self.shared.done_tx.lock().unwrap().take();
        self.shared.close_w.lock().unwrap().take();

        if let Some(reader) = self.reader.lock().unwrap().take() {
            if reader.join().is_err() {
                log::error!("kqueue read loop panicked");
            }
        }
        Ok(())
    }
}

impl Shared {
    /// Registers `path` with the kernel under the given filter mask and
    /// records it in the indices.
    ///
    /// Returns the path that was actually watched (after cleaning and
    /// symlink resolution), or `None` for targets that are silently skipped:
    /// sockets, named pipes and symlinks that cannot be resolved.
    fn add_watch(&self, path: &Path, fflags: FilterFlag) -> Result<Option<PathBuf>, Error> {
        let mut path = path::clean(path);

        let existing = {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
            state
                .watches
                .get(&path)
                .map(|fd| (*fd, state.paths.get(fd).is_some_and(|e| e.is_dir)))
        };

        let already_watching = existing.is_some();
        let (fd, is_dir, mut opened) = match existing {
            // We already have a descriptor; re-registering below just
            // updates the filter mask.
            Some((fd, is_dir)) => (fd, is_dir, None),
            None => {
                let metadata = fs::symlink_metadata(&path)?;
                let file_type = metadata.file_type();

                // Don't watch sockets or named pipes.
                if file_type.is_socket() || file_type.is_fifo() {
                    return Ok(None);
                }

                // Follow symlinks. Linux can watch an unresolvable symlink
                // without complaint, so for consistency a link that fails to
                // resolve is treated as benign: success, no watch, no
                // events.
                let is_dir = if file_type.is_symlink() {
                    let Ok(resolved) = fs::canonicalize(&path) else {
                        return Ok(None);
                    };
                    path = path::clean(&resolved);
                    {
                        let state = self.state.lock().unwrap();
                        if state.watches.contains_key(&path) {
                            return Ok(Some(path));
                        }
                    }
                    let Ok(metadata) = fs::symlink_metadata(&path) else {
                        return Ok(None);
                    };
                    metadata.is_dir()
                } else {
                    metadata.is_dir()
                };

                let file = open_watch_target(&path)?;
                let fd = file.as_raw_fd();
                (fd, is_dir, Some(OwnedFd::from(file)))
            }
        };

        self.register(
            fd,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_ENABLE,
            fflags,
        )
        .map_err(|e| Error::Io(e.into()))?;

        if let Some(owned) = opened.take() {
            let mut state = self.state.lock().unwrap();
            // A concurrent close() may have swept the indices while we were
            // in the kernel; inserting now would leak the descriptor.
            if state.closed {
                return Err(Error::Closed);
            }
            state.watches.insert(path.clone(), fd);
            state
                .watches_by_dir
                .entry(path::parent(&path))
                .or_default()
                .insert(fd);
            state.paths.insert(
                fd,
                WatchEntry {
                    fd: owned,
                    path: path.clone(),
                    is_dir,
                },
            );
            log::trace!("added kqueue watch on {:?} (fd {fd})", path);
        }

        if is_dir {
            // Enumerate the members if the directory was not watched before,
            // or was watched with a mask that did not include writes (a
            // synthesized DELETE|RENAME watch being upgraded by `add`).
            let watch_members = {
                let mut state = self.state.lock().unwrap();
                let watch = fflags.contains(FilterFlag::NOTE_WRITE)
                    && (!already_watching
                        || !state
                            .dir_flags
                            .get(&path)
                            .is_some_and(|f| f.contains(FilterFlag::NOTE_WRITE)));
                state.dir_flags.insert(path.clone(), fflags);
                watch
            };
            if watch_members {
                self.watch_directory_files(&path)?;
            }
        }

        Ok(Some(path))
    }

    /// Installs internal watches on every current member of `dir` and
    /// records them in the remembered set, to mimic the member-level events
    /// inotify provides when watching a directory.
    fn watch_directory_files(&self, dir: &Path) -> Result<(), Error> {
        for entry in fs::read_dir(dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let member = path::clean(&entry.path());
            let is_dir = entry.file_type().map_err(Error::Io)?.is_dir();

            let watched = match self.internal_watch(&member, is_dir) {
                Ok(Some(p)) => p,
                // Skipped (socket, pipe, broken link): remember it anyway so
                // it is not reported as "new" on the next directory write.
                Ok(None) => member,
                // Same for members we have no permission to open; they still
                // show up in the listing.
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => member,
                Err(e) => return Err(e),
            };
            self.state.lock().unwrap().file_exists.insert(watched);
        }
        Ok(())
    }

    /// Watches a directory member with the internal policy: full mask for
    /// files, DELETE|RENAME only for subdirectories (matching inotify, which
    /// does not report writes inside nested directories either). An existing
    /// filter mask on the subdirectory is preserved.
    fn internal_watch(&self, member: &Path, is_dir: bool) -> Result<Option<PathBuf>, Error> {
        if is_dir {
            let flags = {
                let state = self.state.lock().unwrap();
                state.dir_flags.get(member).copied().unwrap_or(FilterFlag::empty())
            };
            self.add_watch(member, flags | FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME)
        } else {
            self.add_watch(member, NOTE_ALL_EVENTS)
        }
    }

    /// Deletes `path` from every index, deregisters its filter and closes
    /// its descriptor. For a directory, the watches synthesized for its
    /// members are cascade-removed.
    fn remove_watch(&self, path: &Path) -> Result<(), Error> {
        let path = path::clean(path);

        // All bookkeeping happens atomically under the lock, before any
        // kernel call: of several racing removers exactly one takes the
        // entry (and with it the descriptor), the others see a missing key.
        let (entry, children) = {
            let mut state = self.state.lock().unwrap();
            let Some(fd) = state.watches.remove(&path) else {
                if state.closed {
                    return Err(Error::Closed);
                }
                return Err(Error::NonExistentWatch(path));
            };
            let entry = state.paths.remove(&fd);
            state.user_watches.remove(&path);
            state.dir_flags.remove(&path);

            let parent = path::parent(&path);
            if let Some(siblings) = state.watches_by_dir.get_mut(&parent) {
                siblings.remove(&fd);
                if siblings.is_empty() {
                    state.watches_by_dir.remove(&parent);
                }
            }

            // Snapshot the internal watches inside a removed directory; they
            // are removed below, after the lock is released, which keeps the
            // recursion out of the critical section.
            let children: Vec<PathBuf> = match &entry {
                Some(e) if e.is_dir => state
                    .watches_by_dir
                    .get(&path)
                    .map(|fds| {
                        fds.iter()
                            .filter_map(|fd| state.paths.get(fd))
                            .filter(|e| !state.user_watches.contains(&e.path))
                            .map(|e| e.path.clone())
                            .collect()
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            (entry, children)
        };

        let mut result = Ok(());
        if let Some(entry) = entry {
            log::trace!("removing kqueue watch on {:?}", entry.path);
            if let Err(e) = self.register(entry.fd.as_raw_fd(), EventFlag::EV_DELETE, FilterFlag::empty()) {
                result = Err(Error::Io(e.into()));
            }
            // Dropping the entry closes the descriptor.
        }

        for child in children {
            // These were never visible to the caller as explicit watches, so
            // errors from their removal are not propagated.
            let _ = self.remove_watch(&child);
        }
        result
    }

    /// Registers one change on the kernel queue for the given descriptor.
    fn register(&self, fd: RawFd, flags: EventFlag, fflags: FilterFlag) -> nix::Result<()> {
        let changes = [KEvent::new(
            fd as usize,
            EventFilter::EVFILT_VNODE,
            flags,
            fflags,
            0,
            0,
        )];
        let mut out: [KEvent; 0] = [];
        self.kq.kevent(&changes, &mut out, None)?;
        Ok(())
    }
}

/// The dedicated reader: blocks in `kevent(2)`, translates vnode flags into
/// [`Event`]s and is the sole sender on both output channels.
struct ReadLoop {
    shared: Arc<Shared>,
    pipe_r: OwnedFd,
    event_tx: Sender<Event>,
    error_tx: Sender<Error>,
    done_rx: Receiver<()>,
    closing: bool,
}

impl ReadLoop {
    fn run(mut self) {
        let pipe_fd = self.pipe_r.as_raw_fd();
        let mut buffer = vec![
            KEvent::new(
                0,
                EventFilter::EVFILT_VNODE,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0
            );
            EVENT_BATCH
        ];

        while !self.closing {
            let n = match self.shared.kq.kevent(&[], &mut buffer, None) {
                Ok(n) => n,
                // The syscall was interrupted by a signal; just retry.
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    if !self.send_error(Error::Io(e.into())) {
                        self.closing = true;
                    }
                    continue;
                }
            };

            for i in 0..n {
                let kevent = buffer[i];
                let fd = kevent.ident() as RawFd;

                // Shut down when the pipe is closed, but only after the
                // remaining events of this batch have been processed.
                if fd == pipe_fd {
                    self.closing = true;
                    continue;
                }
                self.handle_vnode_event(fd, kevent.fflags());
            }
        }

        // Termination order: release the kernel resources, then disconnect
        // the streams last so every reported error is observable.
        let ReadLoop {
            shared,
            pipe_r,
            event_tx,
            error_tx,
            done_rx,
            ..
        } = self;
        drop(pipe_r);
        drop(done_rx);
        drop(shared);
        drop(event_tx);
        drop(error_tx);
        log::debug!("kqueue read loop stopped");
    }

    fn handle_vnode_event(&mut self, fd: RawFd, fflags: FilterFlag) {
        let looked_up = {
            let state = self.shared.state.lock().unwrap();
            state.paths.get(&fd).map(|e| (e.path.clone(), e.is_dir))
        };
        let Some((path, is_dir)) = looked_up else {
            // Stale kevent for a watch removed earlier in the same batch.
            return;
        };

        let mut event = Event::new(path, op_from_fflags(fflags));
        log::trace!("kevent: {event}");

        if is_dir && !event.has(Op::REMOVE) {
            // Double-check that the directory still exists. During a
            // recursive wipe the kernel can report the write on a directory
            // before the delete, after the directory is already gone.
            if let Err(e) = fs::symlink_metadata(&event.path) {
                if e.kind() == io::ErrorKind::NotFound {
                    event.op |= Op::REMOVE;
                }
            }
        }

        if event.has(Op::RENAME) || event.has(Op::REMOVE) {
            // The descriptor now points at a detached vnode; drop the watch
            // and forget the member so a later reappearance counts as new.
            let _ = self.shared.remove_watch(&event.path);
            self.shared.state.lock().unwrap().file_exists.remove(&event.path);
        }

        if is_dir && event.has(Op::WRITE) && !event.has(Op::REMOVE) {
            // A write on a watched directory means its member list changed;
            // report the new members instead of the noisy directory event.
            self.send_directory_change_events(&event.path);
        } else if !self.send_event(event.clone()) {
            self.closing = true;
            return;
        }

        if event.has(Op::REMOVE) {
            // Look for a file that may have overwritten this one: mv f1 f2
            // deletes f2, then recreates it.
            let path = event.path;
            if is_dir {
                let still_watched = self.shared.state.lock().unwrap().watches.contains_key(&path);
                if still_watched && fs::symlink_metadata(&path).is_ok() {
                    self.send_directory_change_events(&path);
                }
            } else if let Ok(metadata) = fs::symlink_metadata(&path) {
                self.send_file_created_event_if_new(&path, metadata.is_dir());
            }
        }
    }

    /// Diffs the directory listing against the remembered member set and
    /// emits a synthetic create for every member seen for the first time.
    fn send_directory_change_events(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if !self.send_error(Error::Io(e)) {
                    self.closing = true;
                }
                return;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { return };
            let Ok(file_type) = entry.file_type() else { return };
            let member = path::clean(&entry.path());
            if !self.send_file_created_event_if_new(&member, file_type.is_dir()) {
                return;
            }
        }
    }

    /// Emits a create for `member` unless it is already tracked, then
    /// installs an internal watch on it so that subsequent events on the
    /// member are observed from the start.
    fn send_file_created_event_if_new(&mut self, member: &Path, is_dir: bool) -> bool {
        let known = self.shared.state.lock().unwrap().file_exists.contains(member);
        if !known && !self.send_event(Event::new(member.to_path_buf(), Op::CREATE)) {
            self.closing = true;
            return false;
        }

        let watched = match self.shared.internal_watch(member, is_dir) {
            Ok(Some(p)) => p,
            Ok(None) => member.to_path_buf(),
            // Unreadable members are remembered without a watch, exactly as
            // in the initial directory scan.
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                member.to_path_buf()
            }
            Err(_) => return false,
        };
        self.shared.state.lock().unwrap().file_exists.insert(watched);
        true
    }

    /// Returns true if the event was sent, false if the watcher is closed.
    fn send_event(&self, event: Event) -> bool {
        select! {
            send(self.event_tx, event) -> res => res.is_ok(),
            recv(self.done_rx) -> _ => false,
        }
    }

    /// Returns true if the error was sent, false if the watcher is closed.
    fn send_error(&self, error: Error) -> bool {
        select! {
            send(self.error_tx, error) -> res => res.is_ok(),
            recv(self.done_rx) -> _ => false,
        }
    }
}

fn op_from_fflags(fflags: FilterFlag) -> Op {
    let mut op = Op::empty();
    if fflags.contains(FilterFlag::NOTE_DELETE) {
        op |= Op::REMOVE;
    }
    if fflags.contains(FilterFlag::NOTE_WRITE) {
        op |= Op::WRITE;
    }
    if fflags.contains(FilterFlag::NOTE_RENAME) {
        op |= Op::RENAME;
    }
    if fflags.contains(FilterFlag::NOTE_ATTRIB) {
        op |= Op::CHMOD;
    }
    op
}

/// Opens a path for watching, retrying when interrupted by a signal (open()
/// does return EINTR in practice on macOS).
fn open_watch_target(path: &Path) -> Result<File, Error> {
    loop {
        match OpenOptions::new().read(true).custom_flags(OPEN_FLAGS).open(path) {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

fn into_io(errno: Errno) -> Error {
    Error::Io(errno.into())
}
