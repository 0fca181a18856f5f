use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by a [`Watcher`](crate::Watcher), either synchronously
/// from its methods or asynchronously on the errors stream.
#[derive(Debug, Error)]
pub enum Error {
    /// `remove` was called on a path that is not being watched.
    #[error("can't remove non-existent watch: {0:?}")]
    NonExistentWatch(PathBuf),

    /// `add` was called after the watcher was closed.
    #[error("watcher already closed")]
    Closed,

    /// The kernel dropped notifications because its event queue overflowed.
    ///
    /// Reported on the errors stream by backends that surface the condition
    /// (inotify's `IN_Q_OVERFLOW`). The watch set is unchanged, but events
    /// may have been lost.
    #[error("kernel event queue overflowed, some events were dropped")]
    Overflow,

    /// An operating system error, e.g. descriptor acquisition or kernel
    /// registration failure. Running out of per-process file descriptors
    /// (`EMFILE`) surfaces here.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
