//! Proc inode index (C1): builds a mapping from socket inode to owning pid
//! by scanning `/proc/<pid>/fd/*` symlinks. See spec §4.1.

use std::path::{Path, PathBuf};

use eyre::Context;
use nix::fcntl::readlink;
use regex::Regex;

use crate::types::PidEntry;

const BUCKETS: usize = 256;

/// Link targets longer than this are treated as non-matches: only the
/// `socket:[` prefix is ever inspected, and the original reads into a
/// fixed 64-byte buffer.
const LINK_BUF_LEN: usize = 64;

/// inode -> owning pid, built at the start of a [`crate::collect_sock_stat`]
/// call and discarded at the end. Backed by a 256-bucket hash using the
/// same mixing function `ss`/iproute2 uses for its own pid table, so that
/// the bucket layout itself is a testable property (spec §3/§8).
#[derive(Debug, Default)]
pub struct InodeIndex {
    buckets: Vec<Vec<PidEntry>>,
}

fn bucket_of(inode: u32) -> usize {
    ((inode ^ (inode >> 8) ^ (inode >> 16) ^ (inode >> 24)) & 0xFF) as usize
}

impl InodeIndex {
    fn empty() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    /// Inserts `(inode, pid)` unless the inode is already present — only
    /// the first observed pid for a given inode is retained.
    fn insert(&mut self, inode: u32, pid: i32) {
        let bucket = &mut self.buckets[bucket_of(inode)];
        if !bucket.iter().any(|e| e.inode == inode) {
            bucket.push(PidEntry { inode, pid });
        }
    }

    /// Returns the first matching entry, or `None` — inode 0 always
    /// returns `None`.
    pub fn lookup(&self, inode: u32) -> Option<PidEntry> {
        if inode == 0 {
            return None;
        }
        self.buckets[bucket_of(inode)]
            .iter()
            .find(|e| e.inode == inode)
            .copied()
    }

    /// Scans `root` (normally `$PROC_ROOT` or `/proc/`) for
    /// `<pid>/fd/<fd> -> socket:[<inode>]` symlinks.
    ///
    /// Non-numeric directory entries, and any `opendir`/`readlink` failure
    /// on a particular pid, are skipped silently — partial enumeration is
    /// preferred over failing the whole scan.
    pub fn build(root: &Path) -> eyre::Result<Self> {
        let mut index = Self::empty();
        let socket_re = Regex::new(r"socket:\[([0-9]+)\]").context("invalid socket-inode regex")?;

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(?root, %err, "could not open proc root");
                return Ok(index);
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };

            let fd_dir = root.join(pid.to_string()).join("fd");
            let fds = match std::fs::read_dir(&fd_dir) {
                Ok(fds) => fds,
                Err(_) => continue,
            };

            for fd in fds.filter_map(Result::ok) {
                let fd_name = fd.file_name();
                if fd_name.to_str().and_then(|s| s.parse::<u32>().ok()).is_none() {
                    continue;
                }

                let Some(inode) = read_socket_inode(&fd.path(), &socket_re) else {
                    continue;
                };

                index.insert(inode, pid);
            }
        }

        Ok(index)
    }
}

/// Reads `path`'s link target and, if it matches `socket:[<digits>]`,
/// returns the inode. Anything else (not a symlink, not a socket, target
/// too long to have fit the original's 64-byte buffer) returns `None`.
fn read_socket_inode(path: &Path, socket_re: &Regex) -> Option<u32> {
    let target = readlink(path).ok()?;
    let target = target.to_str()?;

    if target.len() >= LINK_BUF_LEN {
        return None;
    }

    let inode_str = &socket_re.captures(target)?.extract::<1>().1[0];
    inode_str.parse().ok()
}

/// Resolves `$PROC_ROOT`, defaulting to `/proc/`, the same environment
/// input the original C source reads.
pub fn proc_root() -> PathBuf {
    std::env::var_os("PROC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/proc/"))
}

/// Convenience wrapper: build the index rooted at `$PROC_ROOT`.
pub fn build_inode_index() -> eyre::Result<InodeIndex> {
    InodeIndex::build(&proc_root()).context("failed to scan proc root for socket inodes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn bucket_mixing_matches_spec_formula() {
        let inode = 99_999u32;
        let expected =
            ((inode ^ (inode >> 8) ^ (inode >> 16) ^ (inode >> 24)) & 0xFF) as usize;
        assert_eq!(bucket_of(inode), expected);
    }

    #[test]
    fn lookup_of_zero_inode_is_always_none() {
        let index = InodeIndex::empty();
        assert_eq!(index.lookup(0), None);
    }

    #[test]
    fn first_observed_pid_wins_on_collision() {
        let mut index = InodeIndex::empty();
        index.insert(42, 100);
        index.insert(42, 200);
        assert_eq!(index.lookup(42), Some(PidEntry { inode: 42, pid: 100 }));
    }

    #[test]
    fn build_resolves_inode_to_pid_from_fake_proc_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let fd_dir = tmp.path().join("1234/fd");
        std::fs::create_dir_all(&fd_dir).unwrap();
        symlink("socket:[99999]", fd_dir.join("5")).unwrap();
        symlink("/dev/null", fd_dir.join("6")).unwrap();

        // non-numeric pid directory, must be skipped silently
        std::fs::create_dir_all(tmp.path().join("self/fd")).unwrap();

        let index = InodeIndex::build(tmp.path()).unwrap();
        assert_eq!(
            index.lookup(99999),
            Some(PidEntry { inode: 99999, pid: 1234 })
        );
    }

    #[test]
    fn unreadable_fd_dir_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        // pid dir exists but has no fd subdirectory
        std::fs::create_dir_all(tmp.path().join("1")).unwrap();
        let index = InodeIndex::build(tmp.path()).unwrap();
        assert_eq!(index.lookup(1), None);
    }
}
