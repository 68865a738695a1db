//! Content hashing of candidate inodes, with optional digest caching in user
//! extended attributes.
//!
//! A file's digest is memoized in two attributes: the raw digest bytes and
//! the mtime it was computed at. A cached digest is adopted only when the
//! stored mtime matches the file's current one (or when the stamp is absent,
//! for entries written by older versions), so any modification invalidates
//! the cache.

use std::collections::HashMap;
use std::ffi::CStr;
use std::ffi::CString;
use std::io;
use std::io::Error;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::ptr::null_mut;
use std::slice;

use sha2::Digest;
use sha2::Sha256;

use crate::Config;
use crate::group;
use crate::scan::FileInode;
use crate::scan::Mtime;
use crate::status::Output;
use crate::status::report_path_error;

/// Chunk size fed to the digest, keeping progress granular on large files.
const HASH_CHUNK_SIZE: usize = 32 * 1024 * 1024;
/// Extended attribute holding a file's content digest.
const XATTR_HASH: &CStr = c"user.dedupe.hash";
/// Extended attribute holding the mtime the digest was computed at.
const XATTR_HASH_MTIME: &CStr = c"user.dedupe.hash_mtime";

/// Stored layout of the mtime stamp kept next to a cached digest. Only ever
/// compared bytewise against a value written by the same build.
#[repr(C)]
#[derive(Clone, Copy, Eq, PartialEq)]
struct XattrMtime {
    sec: i64,
    nsec: i64,
}

/// Outcome of probing the xattr cache of one file.
enum CacheLookup {
    /// A digest matching the file's current mtime.
    Hit([u8; 32]),
    Miss,
    /// The filesystem does not support user xattrs. The write-back is skipped
    /// too in this case.
    Unsupported,
}

/// A read-only shared mapping of a whole file.
struct Mmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mmap {
    fn new(fd: RawFd, len: usize) -> io::Result<Self> {
        let ptr = unsafe { libc::mmap(null_mut(), len, libc::PROT_READ, libc::MAP_SHARED, fd, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Opens the first of the inode's paths that can be opened read-only, without
/// following symbolic links. Failed paths are reported as they are tried.
fn open_first_path(inode: &FileInode) -> Option<OwnedFd> {
    for path in &inode.paths {
        let path_c = CString::new(path.as_os_str().as_bytes()).unwrap();
        let fd = unsafe {
            libc::open(
                path_c.as_ptr(),
                libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd >= 0 {
            return Some(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        report_path_error(path, Error::last_os_error());
    }
    None
}

fn read_cached_digest(fd: RawFd, mtime: Mtime) -> CacheLookup {
    let mut digest = [0u8; 32];
    let ret = unsafe {
        libc::fgetxattr(
            fd,
            XATTR_HASH.as_ptr(),
            digest.as_mut_ptr() as *mut _,
            digest.len(),
        )
    };
    if ret < 0 {
        return match Error::last_os_error().raw_os_error() {
            Some(libc::ENOTSUP) => CacheLookup::Unsupported,
            _ => CacheLookup::Miss,
        };
    }
    if ret as usize != digest.len() {
        return CacheLookup::Miss;
    }
    let mut stamp = XattrMtime { sec: 0, nsec: 0 };
    let ret = unsafe {
        libc::fgetxattr(
            fd,
            XATTR_HASH_MTIME.as_ptr(),
            &mut stamp as *mut XattrMtime as *mut _,
            size_of::<XattrMtime>(),
        )
    };
    if ret < 0 {
        return match Error::last_os_error().raw_os_error() {
            // entries written by older versions carry no stamp
            Some(libc::ENODATA) => CacheLookup::Hit(digest),
            _ => CacheLookup::Miss,
        };
    }
    if ret as usize == size_of::<XattrMtime>() && stamp.sec == mtime.sec && stamp.nsec == mtime.nsec
    {
        CacheLookup::Hit(digest)
    } else {
        CacheLookup::Miss
    }
}

fn write_cached_digest(fd: RawFd, digest: &[u8; 32], mtime: Mtime) -> io::Result<()> {
    let ret = unsafe {
        libc::fsetxattr(
            fd,
            XATTR_HASH.as_ptr(),
            digest.as_ptr() as *const _,
            digest.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    let stamp = XattrMtime {
        sec: mtime.sec,
        nsec: mtime.nsec,
    };
    let ret = unsafe {
        libc::fsetxattr(
            fd,
            XATTR_HASH_MTIME.as_ptr(),
            &stamp as *const XattrMtime as *const _,
            size_of::<XattrMtime>(),
            0,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Hashes the file's content through a shared read-only mapping, in fixed
/// chunks. The empty file skips the mapping entirely.
fn digest_content(fd: RawFd, size: u64, out: &mut Output) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    if size > 0 {
        let map = Mmap::new(fd, size as usize)?;
        for chunk in map.as_slice().chunks(HASH_CHUNK_SIZE) {
            hasher.update(chunk);
            out.hash_tick(chunk.len() as u64);
        }
    }
    Ok(hasher.finalize().into())
}

/// Produces the digest of one inode, going through the xattr cache when it is
/// enabled. Returns `None` when no path could be opened or the content could
/// not be mapped; the inode then drops out of the run.
fn hash_inode(config: &Config, inode: &FileInode, out: &mut Output) -> Option<[u8; 32]> {
    let fd = open_first_path(inode)?;
    let mut write_back = config.use_xattrs;
    if config.use_xattrs {
        match read_cached_digest(fd.as_raw_fd(), inode.mtime) {
            CacheLookup::Hit(digest) => {
                out.hash_tick(inode.size);
                return Some(digest);
            }
            CacheLookup::Miss => {}
            CacheLookup::Unsupported => write_back = false,
        }
    }
    let digest = match digest_content(fd.as_raw_fd(), inode.size, out) {
        Ok(digest) => digest,
        Err(e) => {
            report_path_error(&inode.paths[0], e);
            return None;
        }
    };
    if write_back {
        if let Err(e) = write_cached_digest(fd.as_raw_fd(), &digest, inode.mtime) {
            report_path_error(&inode.paths[0], e);
        }
    }
    Some(digest)
}

/// Hashes every queued inode, filling the records' digest fields, and returns
/// the digest map.
pub fn hash_all(
    config: &Config,
    inodes: &mut HashMap<u64, FileInode>,
    queue: &[u64],
    out: &mut Output,
) -> HashMap<[u8; 32], Vec<u64>> {
    let total = group::total_queued_bytes(inodes, queue);
    out.hash_begin(queue.len(), total);
    let mut digests: HashMap<[u8; 32], Vec<u64>> = HashMap::new();
    for ino in queue {
        let Some(inode) = inodes.get(ino) else {
            continue;
        };
        let digest = hash_inode(config, inode, out);
        out.hash_file_done();
        let Some(digest) = digest else {
            continue;
        };
        if let Some(inode) = inodes.get_mut(ino) {
            inode.digest = Some(digest);
        }
        digests.entry(digest).or_default().push(*ino);
    }
    out.hash_end();
    digests
}
