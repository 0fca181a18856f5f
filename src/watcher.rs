use std::path::{Path, PathBuf};

use crossbeam_channel::{bounded, Receiver};

use crate::backend::Backend;
use crate::error::Error;
use crate::event::Event;

/// Watches a set of paths, delivering events on a channel.
///
/// The watcher owns a background reader that blocks in the kernel and
/// translates raw notifications into [`Event`]s. All methods can be called
/// from any thread. Dropping the watcher closes it.
pub struct Watcher {
    events: Receiver<Event>,
    errors: Receiver<Error>,
    backend: Backend,
}

impl Watcher {
    /// Establishes a new watcher with the underlying OS and begins waiting
    /// for events.
    pub fn new() -> Result<Watcher, Error> {
        // Rendezvous channels: the reader's send completes only when the
        // application receives, mirroring the kernel's own backpressure.
        let (event_tx, event_rx) = bounded(0);
        let (error_tx, error_rx) = bounded(0);
        let backend = Backend::new(event_tx, error_tx)?;
        Ok(Watcher {
            events: event_rx,
            errors: error_rx,
            backend,
        })
    }

    /// The stream of filesystem events.
    ///
    /// Disconnects after [`close`](Self::close); iterating the receiver then
    /// terminates.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// The stream of asynchronous errors (see [`Error`]).
    ///
    /// Disconnects after [`close`](Self::close).
    pub fn errors(&self) -> &Receiver<Error> {
        &self.errors
    }

    /// Starts watching the given file or directory (non-recursively).
    ///
    /// Adding a directory also reports creations, writes and removals of its
    /// direct members. Re-adding an already watched path is allowed and does
    /// not duplicate the watch.
    ///
    /// Sockets and named pipes are silently ignored; symbolic links are
    /// resolved, and a link that cannot be resolved is ignored as well.
    ///
    /// # Errors
    /// [`Error::Closed`] after [`close`](Self::close), otherwise the
    /// underlying OS error (notably `EMFILE`-class descriptor exhaustion).
    pub fn add(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.backend.add(path.as_ref())
    }

    /// Stops watching the given path.
    ///
    /// Removing a watched directory also drops the internal member watches
    /// installed by [`add`](Self::add).
    ///
    /// # Errors
    /// [`Error::NonExistentWatch`] if the path is not currently watched, or
    /// [`Error::Closed`] if the watcher has been closed.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.backend.remove(path.as_ref())
    }

    /// A snapshot of the paths currently being watched.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        self.backend.watch_list()
    }

    /// Removes all watches, stops the reader and closes the events and
    /// errors channels. Idempotent: subsequent calls return `Ok` and do
    /// nothing.
    pub fn close(&self) -> Result<(), Error> {
        self.backend.close()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Err(e) = self.backend.close() {
            log::warn!("error while closing the watcher: {e}");
        }
    }
}
