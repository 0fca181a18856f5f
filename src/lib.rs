//! Filesystem change notification on top of the native kernel interfaces:
//! kqueue on the BSDs and macOS, inotify on Linux.
//!
//! A [`Watcher`] watches a set of files and directories (non-recursively)
//! and delivers [`Event`]s on a channel:
//!
//! ```no_run
//! use watchfs::Watcher;
//!
//! let watcher = Watcher::new()?;
//! watcher.add("/tmp/w")?;
//! for event in watcher.events() {
//!     println!("{event}");
//! }
//! # Ok::<(), watchfs::Error>(())
//! ```
//!
//! Adding a directory reports changes to the directory itself and to its
//! direct members: a file created inside a watched directory produces a
//! [`Op::CREATE`] event for that file on every platform, even where the
//! kernel interface (kqueue) has no such notion. Watching does not descend
//! into subdirectories.
//!
//! Asynchronous failures (kernel queue errors, overflow) are delivered on a
//! second channel, [`Watcher::errors`]. Both channels disconnect after
//! [`Watcher::close`].

mod backend;
mod error;
mod event;
mod path;
mod watcher;

pub use error::Error;
pub use event::{Event, Op};
pub use watcher::Watcher;
