//! Directory traversal, producing one record per on-disk inode.
//!
//! The walk is confined to the device of the first root: directories are
//! opened relative to their already-open parent and checked against the
//! confinement device before being entered, so mount points are never
//! descended into. Directory entries sharing an inode number are coalesced
//! into a single record carrying every observed path.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ffi::CStr;
use std::ffi::CString;
use std::io;
use std::io::Error;
use std::mem;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use crate::Config;
use crate::status::Output;
use crate::status::report_path_error;

/// `fnmatch` flag: a slash in the name matches only a slash in the pattern.
const FNM_PATHNAME: libc::c_int = 1;

/// A file modification timestamp, at nanosecond resolution.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Mtime {
    /// Seconds since the Unix epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: i64,
}

impl Mtime {
    fn from_stat(st: &libc::stat) -> Self {
        Self {
            sec: st.st_mtime as i64,
            nsec: st.st_mtime_nsec as i64,
        }
    }
}

/// An on-disk inode together with every path the scan reached it by.
#[derive(Debug)]
pub struct FileInode {
    /// Device the inode lives on.
    pub dev: u64,
    /// Inode number, unique on the scanned device.
    pub ino: u64,
    /// File size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: Mtime,
    /// Content digest, filled by the hashing stage.
    pub digest: Option<[u8; 32]>,
    /// Paths under which the inode was observed, in discovery order.
    pub paths: Vec<PathBuf>,
}

fn cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).unwrap()
}

fn stat(path: &Path) -> io::Result<libc::stat> {
    let path_c = cstring(path);
    let mut st: libc::stat = unsafe { MaybeUninit::zeroed().assume_init() };
    let ret = unsafe { libc::stat(path_c.as_ptr(), &mut st) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(st)
}

fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { MaybeUninit::zeroed().assume_init() };
    let ret = unsafe { libc::fstat(fd, &mut st) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(st)
}

fn fstatat_nofollow(dirfd: RawFd, name: &CStr) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { MaybeUninit::zeroed().assume_init() };
    let ret = unsafe { libc::fstatat(dirfd, name.as_ptr(), &mut st, libc::AT_SYMLINK_NOFOLLOW) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(st)
}

/// Opens the directory `name` relative to the open directory `parent`,
/// without following symbolic links.
fn open_dir_at(parent: RawFd, name: &CStr) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::openat(
            parent,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens a root directory. Unlike the relative opens inside the walk, this
/// follows a symbolic link, matching the stat used for the confinement
/// device.
fn open_root(path: &Path) -> io::Result<OwnedFd> {
    let path_c = cstring(path);
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// An open directory stream. Dropping the stream closes the underlying file
/// descriptor.
struct Dir(*mut libc::DIR);

impl Dir {
    /// Takes ownership of `fd`.
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let dirp = unsafe { libc::fdopendir(fd.as_raw_fd()) };
        if dirp.is_null() {
            return Err(Error::last_os_error());
        }
        // the stream owns the descriptor from here on
        mem::forget(fd);
        Ok(Self(dirp))
    }

    /// The descriptor backing the stream, for relative syscalls.
    fn fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.0) }
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.0);
        }
    }
}

struct Scanner<'c> {
    config: &'c Config,
    /// Device of the first root. The walk never leaves it.
    dev: u64,
    /// Records keyed by inode number.
    inodes: HashMap<u64, FileInode>,
    /// Number of regular directory entries recorded.
    files: u64,
}

impl Scanner<'_> {
    /// Tells whether a directory entry name matches an exclude pattern.
    fn excluded(&self, name: &CStr) -> bool {
        self.config
            .excludes
            .iter()
            .any(|pattern| unsafe { libc::fnmatch(pattern.as_ptr(), name.as_ptr(), FNM_PATHNAME) } == 0)
    }

    /// Records one regular file found as `name` under the open directory
    /// `dirfd`, stat'ing it only the first time its inode number is seen.
    fn add_regular(&mut self, dirfd: RawFd, name: &CStr, ino: u64, full: PathBuf) {
        let record = match self.inodes.entry(ino) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let st = match fstatat_nofollow(dirfd, name) {
                    Ok(st) => st,
                    Err(e) => {
                        report_path_error(&full, e);
                        return;
                    }
                };
                entry.insert(FileInode {
                    dev: st.st_dev as u64,
                    ino,
                    size: st.st_size as u64,
                    mtime: Mtime::from_stat(&st),
                    digest: None,
                    paths: Vec::new(),
                })
            }
        };
        record.paths.push(full);
        self.files += 1;
    }

    /// Walks the directory open as `fd`, known by the logical path `path`.
    ///
    /// Every failure is reported and confined to the entry (or subtree) it
    /// occurred on.
    fn walk(&mut self, fd: OwnedFd, path: &Path) {
        let st = match fstat(fd.as_raw_fd()) {
            Ok(st) => st,
            Err(e) => {
                report_path_error(path, e);
                return;
            }
        };
        if st.st_dev as u64 != self.dev {
            report_path_error(path, Error::from_raw_os_error(libc::EXDEV));
            return;
        }
        let dir = match Dir::new(fd) {
            Ok(dir) => dir,
            Err(e) => {
                report_path_error(path, e);
                return;
            }
        };
        loop {
            let ent = unsafe { libc::readdir(dir.0) };
            if ent.is_null() {
                break;
            }
            let ent = unsafe { &*ent };
            let name = unsafe { CStr::from_ptr(ent.d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            if self.excluded(name) {
                continue;
            }
            let full = path.join(std::ffi::OsStr::from_bytes(bytes));
            match ent.d_type {
                libc::DT_DIR => self.enter(dir.fd(), name, &full),
                libc::DT_REG => self.add_regular(dir.fd(), name, ent.d_ino as u64, full),
                libc::DT_UNKNOWN => {
                    // the filesystem does not fill entry types in
                    let st = match fstatat_nofollow(dir.fd(), name) {
                        Ok(st) => st,
                        Err(e) => {
                            report_path_error(&full, e);
                            continue;
                        }
                    };
                    match st.st_mode & libc::S_IFMT {
                        libc::S_IFDIR => self.enter(dir.fd(), name, &full),
                        libc::S_IFREG => {
                            self.add_regular(dir.fd(), name, st.st_ino as u64, full)
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    /// Opens the child directory `name` of `dirfd` and recurses into it.
    fn enter(&mut self, dirfd: RawFd, name: &CStr, full: &Path) {
        match open_dir_at(dirfd, name) {
            Ok(fd) => self.walk(fd, full),
            Err(e) => report_path_error(full, e),
        }
    }
}

/// Walks every configured root and returns the discovered inodes, keyed by
/// inode number.
///
/// The only fatal error is a failed stat of the first root; everything else
/// is reported on stderr and skipped.
pub fn scan(config: &Config, out: &mut Output) -> io::Result<HashMap<u64, FileInode>> {
    let Some(first) = config.roots.first() else {
        return Ok(HashMap::new());
    };
    let st = stat(first)?;
    let mut scanner = Scanner {
        config,
        dev: st.st_dev as u64,
        inodes: HashMap::new(),
        files: 0,
    };
    for root in &config.roots {
        match open_root(root) {
            Ok(fd) => scanner.walk(fd, root),
            Err(e) => report_path_error(root, e),
        }
    }
    out.scan_done(scanner.files, scanner.inodes.len());
    Ok(scanner.inodes)
}
