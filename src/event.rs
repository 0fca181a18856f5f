//! Platform-independent description of a filesystem change.

use std::fmt;
use std::path::PathBuf;

bitflags::bitflags! {
    /// Set of operations carried by a single [`Event`].
    ///
    /// A single kernel notification can describe several operations at once
    /// (for example a directory that was both written to and removed), so an
    /// event carries a set of bits rather than a single variant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Op: u32 {
        /// A new file or directory appeared in a watched directory.
        const CREATE = 1 << 0;
        /// The contents of the path were modified.
        const WRITE = 1 << 1;
        /// The path was removed.
        const REMOVE = 1 << 2;
        /// The path was renamed to something else.
        const RENAME = 1 << 3;
        /// The attributes of the path changed (permissions, timestamps, ...).
        const CHMOD = 1 << 4;
    }
}

// Rendering order is fixed, regardless of the order the bits were set in.
const OP_NAMES: [(Op, &str); 5] = [
    (Op::CREATE, "CREATE"),
    (Op::WRITE, "WRITE"),
    (Op::REMOVE, "REMOVE"),
    (Op::RENAME, "RENAME"),
    (Op::CHMOD, "CHMOD"),
];

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (op, name) in OP_NAMES {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A single filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Path the operation applies to, as registered with
    /// [`Watcher::add`](crate::Watcher::add) (cleaned, and with the member
    /// name joined for events inside a watched directory).
    pub path: PathBuf,
    /// The operations that were observed on `path`.
    pub op: Op,
}

impl Event {
    pub(crate) fn new(path: PathBuf, op: Op) -> Self {
        Self { path, op }
    }

    /// Returns true if the event carries all the bits of `op`.
    pub fn has(&self, op: Op) -> bool {
        self.op.contains(op)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\": {}", self.path.display(), self.op)
    }
}
