//! The file tree protocol.
//!
//! Every file in the tree is a [`Node`]. A node always knows how to stat
//! itself; the rest of the operations are optional and advertised through
//! [`Caps`], which callers check instead of looking at concrete types.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use skein_core::{Receiver, Sender};
use skein_proto::Dir;

use crate::error::FsError;

bitflags! {
    /// Operations a node supports beyond `stat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Caps: u8 {
        /// `walk` to a child
        const WALK = 1 << 0;
        /// `get` file data
        const GET = 1 << 1;
        /// `put` file data
        const PUT = 1 << 2;
        /// `mkdir` a child
        const MKDIR = 1 << 3;
        /// `remove` a child
        const REMOVE = 1 << 4;
        /// `mv` a child
        const MOVE = 1 << 5;
        /// `wstat` attributes
        const WSTAT = 1 << 6;
        /// Directory listing
        const GETDIR = 1 << 7;
    }
}

/// A file or directory served by the tree.
///
/// Directory operations (`mkdir`, `remove`, `mv`, and `put` of a new name)
/// are called on the parent. Default methods fail with [`FsError::Perm`];
/// a node overriding one must also advertise it in [`Node::caps`].
#[async_trait]
pub trait Node: Send + Sync {
    /// Path of the node, used in error messages.
    fn path(&self) -> String;

    /// Returns the node's attributes. `name`, `type`, `mode` and `size` are
    /// always set.
    fn stat(&self) -> Dir;

    /// Operations supported by the node.
    fn caps(&self) -> Caps;

    /// Tells clients not to cache attributes for anything in this subtree.
    fn all_virtual(&self) -> bool {
        false
    }

    /// Looks up a child.
    fn walk(&self, name: &str) -> Result<Arc<dyn Node>, FsError> {
        Err(FsError::NotDir(format!("{}/{}", self.path(), name)))
    }

    /// Child names, in listing order.
    fn getdir(&self) -> Result<Vec<String>, FsError> {
        Err(FsError::NotDir(self.path()))
    }

    /// Sends up to `count` bytes from `off` (`count < 0` means to the end).
    /// Returns the number of bytes sent.
    async fn get(&self, _off: u64, _count: i64, _out: &Sender<Bytes>) -> Result<u64, FsError> {
        Err(FsError::Perm(self.path()))
    }

    /// Stores the data received from `input`.
    ///
    /// `name` is empty when writing the node itself, or names a child to
    /// create when the node is a directory.
    async fn put(
        &self,
        _name: &str,
        _meta: &Dir,
        _off: u64,
        _input: Receiver<Bytes>,
    ) -> Result<u64, FsError> {
        Err(FsError::Perm(self.path()))
    }

    /// Creates the child directory `name`.
    async fn mkdir(&self, name: &str, _meta: &Dir) -> Result<(), FsError> {
        Err(FsError::Perm(format!("{}/{}", self.path(), name)))
    }

    /// Removes the child `name`.
    async fn remove(&self, name: &str, _all: bool) -> Result<(), FsError> {
        Err(FsError::Perm(format!("{}/{}", self.path(), name)))
    }

    /// Moves the child `name` into `target` as `new_name`.
    async fn mv(&self, name: &str, _target: Arc<dyn Node>, _new_name: &str) -> Result<(), FsError> {
        Err(FsError::Perm(format!("{}/{}", self.path(), name)))
    }

    /// Updates attributes.
    async fn wstat(&self, _d: &Dir) -> Result<(), FsError> {
        Err(FsError::Perm(self.path()))
    }
}

/// Builds the attributes shared by every node.
pub(crate) fn attrs(name: &str, typ: &str, mode: u32, size: u64, owner: &str) -> Dir {
    let mut d = Dir::new()
        .with("name", name)
        .with("type", typ)
        .with("uid", owner)
        .with("gid", owner);
    d.set_mode(mode);
    d.set_size(size);
    d
}

/// Sends `data[off..]` in chunks of at most `chunk` bytes, honoring `count`.
pub(crate) async fn send_slice(
    data: &[u8],
    off: u64,
    count: i64,
    chunk: usize,
    out: &Sender<Bytes>,
) -> Result<u64, FsError> {
    let start = usize::try_from(off).unwrap_or(usize::MAX).min(data.len());
    let mut end = data.len();
    if count >= 0 {
        end = end.min(start.saturating_add(count as usize));
    }
    let mut tot = 0u64;
    for part in data[start..end].chunks(chunk.max(1)) {
        out.send(Bytes::copy_from_slice(part)).await?;
        tot += part.len() as u64;
    }
    Ok(tot)
}

/// Collects everything sent over `input` as a string.
pub(crate) async fn read_string(path: &str, input: Receiver<Bytes>) -> Result<(String, u64), FsError> {
    let (chunks, err) = input.drain().await;
    if let Some(e) = err {
        return Err(FsError::Stream(e));
    }
    let data: Vec<u8> = chunks.concat();
    let n = data.len() as u64;
    let s = String::from_utf8(data)
        .map_err(|_| FsError::Stream(format!("{}: text is not utf-8", path).into()))?;
    Ok((s, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{channel, preloaded};

    #[tokio::test]
    async fn test_send_slice_ranges() {
        let data = b"hello world";
        let (tx, rx) = channel(16);
        let n = send_slice(data, 6, -1, 2, &tx).await.unwrap();
        tx.close();
        assert_eq!(n, 5);
        let (chunks, err) = rx.drain().await;
        assert!(err.is_none());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"world");

        let (tx, rx) = channel(16);
        assert_eq!(send_slice(data, 0, 4, 16, &tx).await.unwrap(), 4);
        assert_eq!(send_slice(data, 100, -1, 16, &tx).await.unwrap(), 0);
        tx.close();
        assert_eq!(rx.drain().await.0.concat(), b"hell");
    }

    #[tokio::test]
    async fn test_read_string() {
        let rx = preloaded(vec![Bytes::from_static(b"echo "), Bytes::from_static(b"hi")]);
        let (s, n) = read_string("/x", rx).await.unwrap();
        assert_eq!(s, "echo hi");
        assert_eq!(n, 7);

        let (tx, rx) = channel::<Bytes>(1);
        tx.close_with(Some("gone".into()));
        assert!(read_string("/x", rx).await.is_err());
    }

    #[test]
    fn test_attrs() {
        let d = attrs("out", "-", 0o440, 3, "nemo");
        assert_eq!(d.name(), "out");
        assert_eq!(d.mode(), 0o440);
        assert_eq!(d.size(), 3);
        assert_eq!(d.get("uid"), "nemo");
        assert!(!d.is_dir());
    }
}
