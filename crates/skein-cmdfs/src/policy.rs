//! Permission checks.

use skein_proto::Dir;

/// Identity of the caller of a tree operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Who {
    /// User name
    pub uid: String,
    /// Group names
    pub gids: Vec<String>,
}

impl Who {
    /// Creates an identity with a single group named after the user.
    pub fn new(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            gids: vec![uid.clone()],
            uid,
        }
    }
}

/// Decides whether a caller may access a file, given its attributes.
pub trait Policy: Send + Sync {
    /// Reading data or listing a directory.
    fn can_read(&self, d: &Dir, who: &Who) -> bool;

    /// Writing data or changing a directory.
    fn can_write(&self, d: &Dir, who: &Who) -> bool;

    /// Walking through a directory.
    fn can_exec(&self, d: &Dir, who: &Who) -> bool;
}

/// Unix permission bits: owner, then group, then other.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPolicy;

impl UnixPolicy {
    fn allows(d: &Dir, who: &Who, bit: u32) -> bool {
        if !d.contains("mode") {
            return true;
        }
        let mode = d.mode();
        let shift = if d.get("uid") == who.uid {
            6
        } else if who.gids.iter().any(|g| g == d.get("gid")) {
            3
        } else {
            0
        };
        mode & (bit << shift) != 0
    }
}

impl Policy for UnixPolicy {
    fn can_read(&self, d: &Dir, who: &Who) -> bool {
        Self::allows(d, who, 0o4)
    }

    fn can_write(&self, d: &Dir, who: &Who) -> bool {
        Self::allows(d, who, 0o2)
    }

    fn can_exec(&self, d: &Dir, who: &Who) -> bool {
        Self::allows(d, who, 0o1)
    }
}

/// No checks at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn can_read(&self, _: &Dir, _: &Who) -> bool {
        true
    }

    fn can_write(&self, _: &Dir, _: &Who) -> bool {
        true
    }

    fn can_exec(&self, _: &Dir, _: &Who) -> bool {
        true
    }
}
