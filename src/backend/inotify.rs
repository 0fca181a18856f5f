//! Watcher backend based on inotify (Linux).
//!
//! inotify reports member-level events for a watched directory natively, so
//! unlike the kqueue backend there is no create synthesis and no per-member
//! bookkeeping: one watch descriptor per added path, two index maps, and a
//! reader thread that drains the inotify descriptor.
//!
//! The reader blocks in `epoll` (through mio's `Poll`) on the inotify
//! descriptor plus a [`mio::Waker`], which plays the role the self-pipe
//! plays for kqueue: waking the blocked thread on shutdown without polling.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::{fs, thread};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::event::{Event, Op};
use crate::path;

const WATCH_TOKEN: Token = Token(0);
const STOP_TOKEN: Token = Token(1);

// AddWatchFlags ops are not const
fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF
}

pub(crate) struct Backend {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    inotify: Inotify,
    /// Wakes the reader out of `epoll_wait` on shutdown.
    waker: Waker,
    /// Sender half of the `done` signal; taken and dropped by `close` so
    /// that an emission in flight is abandoned instead of blocking forever.
    done_tx: Mutex<Option<Sender<()>>>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    /// Watched path -> kernel watch descriptor.
    watches: FxHashMap<PathBuf, WatchDescriptor>,
    /// Kernel watch descriptor -> watched path, for event delivery.
    paths: FxHashMap<WatchDescriptor, PathBuf>,
}

impl Backend {
    pub(crate) fn new(event_tx: Sender<Event>, error_tx: Sender<Error>) -> Result<Self, Error> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(into_io)?;

        let poll = Poll::new()?;
        // NOTE: it seems to work better when the waker is registered first.
        let waker = Waker::new(poll.registry(), STOP_TOKEN)?;
        let inotify_fd = inotify.as_fd().as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&inotify_fd), WATCH_TOKEN, Interest::READABLE)?;

        let (done_tx, done_rx) = bounded::<()>(0);
        let shared = Arc::new(Shared {
            inotify,
            waker,
            done_tx: Mutex::new(Some(done_tx)),
            state: Mutex::new(State::default()),
        });

        let read_loop = ReadLoop {
            shared: Arc::clone(&shared),
            poll,
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
        let mut path = path::clean(path);
        {
            let state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
        }

        // Same benign cases as on kqueue: sockets, named pipes and broken
        // symlinks are accepted and silently not watched.
        let metadata = fs::symlink_metadata(&path)?;
        let file_type = metadata.file_type();
        if file_type.is_socket() || file_type.is_fifo() {
            return Ok(());
        }
        if file_type.is_symlink() {
            let Ok(resolved) = fs::canonicalize(&path) else {
                return Ok(());
            };
            path = path::clean(&resolved);
        }

        // Re-adding a watched path makes the kernel return the existing
        // descriptor with the mask replaced, so this is naturally idempotent.
        let wd = self.shared.inotify.add_watch(&path, watch_mask()).map_err(into_io)?;

        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            // close() swept the watches while we were registering.
            drop(state);
            let _ = self.shared.inotify.rm_watch(wd);
            return Err(Error::Closed);
        }
        log::trace!("added inotify watch on {:?}", path);
        state.watches.insert(path.clone(), wd);
        state.paths.insert(wd, path);
        Ok(())
    }

    pub(crate) fn remove(&self, path: &Path) -> Result<(), Error> {
        let path = path::clean(path);
        let wd = {
            let mut state = self.shared.state.lock().unwrap();
            let Some(wd) = state.watches.remove(&path) else {
                if state.closed {
                    return Err(Error::Closed);
                }
                return Err(Error::NonExistentWatch(path));
            };
            state.paths.remove(&wd);
            wd
        };
        // The kernel queues IN_IGNORED for the descriptor; the reader drops
        // it since the indices no longer know it. The removal can also race
        // with the kernel retiring the watch on its own (deleted target), in
        // which case rm_watch reports EINVAL for a watch that is gone anyway.
        if let Err(e) = self.shared.inotify.rm_watch(wd) {
            log::debug!("rm_watch on {:?}: {e}", path);
        }
        Ok(())
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
            let _ = self.remove(p);
        }

        // Fire `done` first so an emission in flight is abandoned, then wake
        // the reader out of epoll.
        self.shared.done_tx.lock().unwrap().take();
        self.shared.waker.wake().map_err(Error::Io)?;

        if let Some(reader) = self.reader.lock().unwrap().take() {
            if reader.join().is_err() {
                log::error!("inotify read loop panicked");
            }
        }
        Ok(())
    }
}

/// The dedicated reader: drains the inotify descriptor, translates masks
/// into [`Event`]s and is the sole sender on both output channels.
struct ReadLoop {
    shared: Arc<Shared>,
    poll: Poll,
    event_tx: Sender<Event>,
    error_tx: Sender<Error>,
    done_rx: Receiver<()>,
    closing: bool,
}

impl ReadLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);

        while !self.closing {
            if let Err(e) = self.poll.poll(&mut events, None) {
                // The syscall was interrupted by a signal; just retry.
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if !self.send_error(Error::Io(e)) {
                    self.closing = true;
                }
                continue;
            }

            for event in events.iter() {
                if event.token() == STOP_TOKEN {
                    self.closing = true;
                } else {
                    self.drain_inotify();
                }
            }
        }

        // Disconnect the streams last so every reported error is observable.
        let ReadLoop {
            shared,
            poll,
            event_tx,
            error_tx,
            done_rx,
            ..
        } = self;
        drop(poll);
        drop(done_rx);
        drop(shared);
        drop(event_tx);
        drop(error_tx);
        log::debug!("inotify read loop stopped");
    }

    /// Reads inotify events until the descriptor is dry. mio's epoll is
    /// edge-triggered, so leaving buffered events unread would silence the
    /// watcher until the next kernel notification.
    fn drain_inotify(&mut self) {
        while !self.closing {
            match self.shared.inotify.read_events() {
                Ok(batch) => {
                    for event in batch {
                        self.handle_inotify_event(event);
                    }
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    if !self.send_error(Error::Io(e.into())) {
                        self.closing = true;
                    }
                    return;
                }
            }
        }
    }

    fn handle_inotify_event(&mut self, event: InotifyEvent) {
        let mask = event.mask;

        if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            if !self.send_error(Error::Overflow) {
                self.closing = true;
            }
            return;
        }

        if mask.contains(AddWatchFlags::IN_IGNORED) {
            // The kernel retired the descriptor, either after rm_watch or
            // because the watched path vanished.
            let mut state = self.shared.state.lock().unwrap();
            if let Some(path) = state.paths.remove(&event.wd) {
                state.watches.remove(&path);
            }
            return;
        }

        let watched = {
            let state = self.shared.state.lock().unwrap();
            state.paths.get(&event.wd).cloned()
        };
        let Some(watched) = watched else {
            // Event queued before the watch was removed.
            return;
        };

        let path = match &event.name {
            Some(name) => watched.join(name),
            None => watched,
        };
        let op = op_from_mask(mask);
        if op.is_empty() {
            return;
        }

        let event = Event::new(path, op);
        log::trace!("inotify event: {event}");
        if !self.send_event(event) {
            self.closing = true;
        }
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

fn op_from_mask(mask: AddWatchFlags) -> Op {
    let mut op = Op::empty();
    if mask.intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO) {
        op |= Op::CREATE;
    }
    if mask.contains(AddWatchFlags::IN_MODIFY) {
        op |= Op::WRITE;
    }
    if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF) {
        op |= Op::REMOVE;
    }
    if mask.intersects(AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_MOVE_SELF) {
        op |= Op::RENAME;
    }
    if mask.contains(AddWatchFlags::IN_ATTRIB) {
        op |= Op::CHMOD;
    }
    op
}

fn into_io(errno: Errno) -> Error {
    Error::Io(errno.into())
}
