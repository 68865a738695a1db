//! Replacement of duplicate paths with hard links to a canonical inode.
//!
//! Every destination path is rewritten in two steps: a hard link to the
//! canonical content is created under a random temporary name in the
//! destination's directory, then renamed over the destination. The rename is
//! the atomic primitive on a single filesystem, so at no point does the
//! destination path stop referring to a file with the right content.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::io::Error;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use rand_core::OsRng;
use rand_core::RngCore;

use crate::Config;
use crate::prompt::prompt;
use crate::scan::FileInode;
use crate::status::Output;
use crate::status::report_path_error;

/// Attempts at drawing an unused temporary name before giving up on a path.
const TMP_NAME_ATTEMPTS: u32 = 16;

/// Counters accumulated over the relink stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Number of successfully replaced paths.
    pub relinks: u64,
    /// Bytes reclaimed, counting the canonical inode's size once per
    /// replaced path.
    pub saved: u64,
}

fn cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).unwrap()
}

fn link(from: &Path, to: &Path) -> io::Result<()> {
    let from_c = cstring(from);
    let to_c = cstring(to);
    let ret = unsafe { libc::link(from_c.as_ptr(), to_c.as_ptr()) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn rename(from: &Path, to: &Path) -> io::Result<()> {
    let from_c = cstring(from);
    let to_c = cstring(to);
    let ret = unsafe { libc::rename(from_c.as_ptr(), to_c.as_ptr()) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn unlink(path: &Path) -> io::Result<()> {
    let path_c = cstring(path);
    let ret = unsafe { libc::unlink(path_c.as_ptr()) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Total order selecting the canonical inode of a bucket: earliest
/// modification first, ties broken by inode number.
fn winner_order(a: &FileInode, b: &FileInode) -> Ordering {
    (a.mtime.sec, a.mtime.nsec, a.ino).cmp(&(b.mtime.sec, b.mtime.nsec, b.ino))
}

/// Creates a hard link to one of `source`'s paths under a fresh random name
/// inside `parent` and returns the temporary path.
///
/// A name collision redraws the nonce, up to [`TMP_NAME_ATTEMPTS`] times; any
/// other link failure moves on to the source's next path.
fn link_to_temporary(parent: &Path, source: &FileInode) -> Option<PathBuf> {
    for _ in 0..TMP_NAME_ATTEMPTS {
        let tmp = parent.join(format!(".tmp{:08x}~", OsRng.next_u32()));
        let mut collided = false;
        for source_path in &source.paths {
            match link(source_path, &tmp) {
                Ok(()) => return Some(tmp),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    collided = true;
                    break;
                }
                Err(e) => report_path_error(source_path, e),
            }
        }
        if !collided {
            // every source path failed for a reason other than a name clash
            return None;
        }
    }
    report_path_error(parent, "too many temporary name collisions");
    None
}

/// Replaces the directory entry at `dest` with a hard link to the content of
/// `source`. Returns whether the rename went through.
fn relink_path(dest: &Path, source: &FileInode) -> bool {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let Some(tmp) = link_to_temporary(parent, source) else {
        return false;
    };
    match rename(&tmp, dest) {
        Ok(()) => true,
        Err(e) => {
            report_path_error(dest, e);
            if let Err(e) = unlink(&tmp) {
                report_path_error(&tmp, e);
            }
            false
        }
    }
}

/// Asks the operator whether to relink the current group. End of input counts
/// as a refusal.
fn confirm() -> bool {
    loop {
        let Some(line) = prompt("relink? (y/n) ") else {
            return false;
        };
        match line.trim() {
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => {}
        }
    }
}

/// Processes every digest bucket: picks the canonical inode, reports the
/// group, and replaces each path of the other inodes with a hard link to it.
pub fn relink_all(
    config: &Config,
    inodes: &HashMap<u64, FileInode>,
    buckets: &[([u8; 32], Vec<u64>)],
    out: &mut Output,
) -> Stats {
    let mut stats = Stats::default();
    for (digest, members) in buckets {
        let mut members: Vec<&FileInode> =
            members.iter().filter_map(|ino| inodes.get(ino)).collect();
        if members.len() < 2 {
            continue;
        }
        members.sort_unstable_by(|a, b| winner_order(a, b));
        // inode numbers are unique on the device, so the order is total
        debug_assert!(
            members
                .windows(2)
                .all(|pair| winner_order(pair[0], pair[1]) == Ordering::Less)
        );
        if config.verbose || config.interactive {
            out.report_group(digest, &members);
        }
        if config.interactive && !confirm() {
            continue;
        }
        if config.dry_run {
            continue;
        }
        let Some((&source, dests)) = members.split_first() else {
            continue;
        };
        for dest in dests {
            for path in &dest.paths {
                if relink_path(path, source) {
                    stats.relinks += 1;
                    stats.saved += source.size;
                }
            }
        }
    }
    if config.verbose && stats.relinks >= 1 {
        out.summary(stats);
    }
    stats
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::Mtime;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use tempdir::TempDir;

    fn inode(ino: u64, sec: i64, nsec: i64) -> FileInode {
        FileInode {
            dev: 1,
            ino,
            size: 0,
            mtime: Mtime { sec, nsec },
            digest: None,
            paths: Vec::new(),
        }
    }

    #[test]
    fn winner_is_the_earliest_then_lowest_inode() {
        let mut members = vec![
            inode(3, 200, 0),
            inode(9, 100, 500),
            inode(2, 100, 500),
            inode(5, 100, 0),
        ];
        members.sort_unstable_by(|a, b| winner_order(a, b));
        let order: Vec<u64> = members.iter().map(|m| m.ino).collect();
        assert_eq!(order, [5, 2, 9, 3]);
    }

    #[test]
    fn winner_order_is_total_on_distinct_inodes() {
        let a = inode(1, 100, 0);
        let b = inode(2, 100, 0);
        assert_eq!(winner_order(&a, &b), Ordering::Less);
        assert_eq!(winner_order(&b, &a), Ordering::Greater);
    }

    #[test]
    fn temporary_link_lands_in_the_parent_directory() {
        let dir = TempDir::new("relink").unwrap();
        let source_path = dir.path().join("source");
        fs::write(&source_path, b"content").unwrap();
        let meta = fs::metadata(&source_path).unwrap();
        let source = FileInode {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.len(),
            mtime: Mtime::default(),
            digest: None,
            paths: vec![source_path.clone()],
        };

        let tmp = link_to_temporary(dir.path(), &source).unwrap();
        assert_eq!(tmp.parent().unwrap(), dir.path());
        assert_eq!(fs::metadata(&tmp).unwrap().ino(), meta.ino());
        let name = tmp.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".tmp") && name.ends_with('~'));
        fs::remove_file(&tmp).unwrap();
    }

    #[test]
    fn relink_replaces_the_destination_in_place() {
        let dir = TempDir::new("relink").unwrap();
        let source_path = dir.path().join("source");
        let dest_path = dir.path().join("dest");
        fs::write(&source_path, b"canonical").unwrap();
        fs::write(&dest_path, b"duplicate").unwrap();
        let meta = fs::metadata(&source_path).unwrap();
        let source = FileInode {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.len(),
            mtime: Mtime::default(),
            digest: None,
            paths: vec![source_path.clone()],
        };

        assert!(relink_path(&dest_path, &source));
        assert_eq!(fs::metadata(&dest_path).unwrap().ino(), meta.ino());
        assert_eq!(fs::read(&dest_path).unwrap(), b"canonical");
        // no temporary is left behind
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn unlinkable_source_skips_the_destination() {
        let dir = TempDir::new("relink").unwrap();
        let dest_path = dir.path().join("dest");
        fs::write(&dest_path, b"duplicate").unwrap();
        let source = FileInode {
            dev: 1,
            ino: 1,
            size: 9,
            mtime: Mtime::default(),
            digest: None,
            paths: vec![dir.path().join("vanished")],
        };

        assert!(!relink_path(&dest_path, &source));
        assert_eq!(fs::read(&dest_path).unwrap(), b"duplicate");
    }
}
