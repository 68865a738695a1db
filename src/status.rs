//! Progress display and reporting.
//!
//! All progress output is gated on the verbose flag. ANSI sequences are used
//! only when standard output is a terminal and colored output has not been
//! disabled; progress is then drawn as a single line rewritten in place.

use std::fmt;
use std::io;
use std::io::Write;
use std::mem::MaybeUninit;
use std::path::Path;

use crate::Config;
use crate::relink::Stats;
use crate::scan::FileInode;
use crate::scan::Mtime;

/// SGR sequence starting emphasized output.
const SGR_BOLD: &str = "\x1b[1m";
/// SGR sequence resetting attributes.
const SGR_RESET: &str = "\x1b[0m";
/// Erases the current line and returns the cursor to column zero.
const ERASE_LINE: &str = "\r\x1b[K";

/// Writes one `path: reason` line on stderr.
pub fn report_path_error<E: fmt::Display>(path: &Path, err: E) {
    eprintln!("{}: {err}", path.display());
}

/// Hexadecimal rendering of a content digest.
pub struct DigestHex<'d>(pub &'d [u8; 32]);

impl fmt::Display for DigestHex<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(fmt, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Formats a timestamp as local time, keeping the nanoseconds.
pub fn format_mtime(mtime: Mtime) -> String {
    let mut tm: libc::tm = unsafe { MaybeUninit::zeroed().assume_init() };
    let time = mtime.sec as libc::time_t;
    unsafe {
        libc::localtime_r(&time, &mut tm);
    }
    let mut buf = [0u8; 64];
    let len = unsafe {
        libc::strftime(
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            c"%Y-%m-%d %H:%M:%S".as_ptr(),
            &tm,
        )
    };
    let base = std::str::from_utf8(&buf[..len]).unwrap_or("?");
    format!("{base}.{:09}", mtime.nsec)
}

/// Sink for progress lines and duplicate group reports.
pub struct Output {
    /// Whether progress lines are emitted at all.
    verbose: bool,
    /// Whether ANSI sequences may be used.
    color: bool,
    /// Whether a progress line is on screen and still to be terminated.
    dirty: bool,
    files_done: usize,
    files_total: usize,
    bytes_done: u64,
    bytes_total: u64,
}

impl Output {
    pub fn new(config: &Config) -> Self {
        let tty = unsafe { libc::isatty(libc::STDOUT_FILENO) } != 0;
        Self {
            verbose: config.verbose,
            color: tty && !config.boring,
            dirty: false,
            files_done: 0,
            files_total: 0,
            bytes_done: 0,
            bytes_total: 0,
        }
    }

    /// Reports the end of the scan stage.
    pub fn scan_done(&self, files: u64, inodes: usize) {
        if self.verbose {
            println!("scanned {files} file(s), {inodes} inode(s)");
        }
    }

    /// Starts the hash stage progress over `files` files and `bytes` bytes.
    pub fn hash_begin(&mut self, files: usize, bytes: u64) {
        self.files_total = files;
        self.bytes_total = bytes;
        if self.verbose && files > 0 {
            println!("hashing {files} file(s), {bytes} byte(s)");
        }
    }

    /// Accounts `bytes` more hashed bytes and redraws the progress line on a
    /// terminal.
    pub fn hash_tick(&mut self, bytes: u64) {
        self.bytes_done += bytes;
        if self.verbose && self.color {
            print!(
                "{ERASE_LINE}hash: {}/{} file(s), {}/{} byte(s)",
                self.files_done, self.files_total, self.bytes_done, self.bytes_total
            );
            let _ = io::stdout().flush();
            self.dirty = true;
        }
    }

    /// Accounts one fully processed file.
    pub fn hash_file_done(&mut self) {
        self.files_done += 1;
        if !self.verbose {
            return;
        }
        if self.color {
            self.hash_tick(0);
        } else {
            println!(
                "hash: {}/{} file(s), {}/{} byte(s)",
                self.files_done, self.files_total, self.bytes_done, self.bytes_total
            );
        }
    }

    /// Terminates the progress line, if one is on screen.
    pub fn hash_end(&mut self) {
        if self.dirty {
            println!();
            self.dirty = false;
        }
    }

    /// Prints one duplicate group: the digest, then one block per inode with
    /// its paths.
    pub fn report_group(&self, digest: &[u8; 32], members: &[&FileInode]) {
        if self.color {
            println!("{SGR_BOLD}{}{SGR_RESET}", DigestHex(digest));
        } else {
            println!("{}", DigestHex(digest));
        }
        for inode in members {
            println!(
                "  inode {} size {} mtime {}",
                inode.ino,
                inode.size,
                format_mtime(inode.mtime)
            );
            for path in &inode.paths {
                println!("    {}", path.display());
            }
        }
    }

    /// Prints the end-of-run summary.
    pub fn summary(&self, stats: Stats) {
        println!(
            "Performed {} relink(s), saved {} bytes.",
            stats.relinks, stats.saved
        );
    }
}
