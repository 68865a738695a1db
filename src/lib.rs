//! `dedupe` finds regular files with identical content under a set of
//! directory trees and replaces duplicates with hard links to a single copy,
//! reclaiming the space taken by the redundant copies.
//!
//! The pipeline runs in five sequential stages: scan the trees ([`scan`]),
//! partition the discovered inodes by size ([`group`]), hash the candidates
//! ([`hash`]), partition by digest ([`group`]) and finally replace duplicate
//! paths with hard links ([`relink`]).

pub mod group;
pub mod hash;
pub mod prompt;
pub mod relink;
pub mod scan;
pub mod status;

use std::ffi::CString;
use std::io;
use std::path::PathBuf;

use crate::relink::Stats;
use crate::status::Output;

/// Runtime configuration of the pipeline.
#[derive(Default)]
pub struct Config {
    /// If true, never emit ANSI escape sequences, even on a terminal.
    pub boring: bool,
    /// If true, print per-stage progress and duplicate group reports.
    pub verbose: bool,
    /// If true, perform discovery and reporting but skip the relink phase.
    pub dry_run: bool,
    /// If true, ask for confirmation before relinking each group.
    pub interactive: bool,
    /// If true, cache content digests in user extended attributes.
    pub use_xattrs: bool,
    /// Glob patterns. A directory entry whose name matches any of them is
    /// skipped during the scan.
    pub excludes: Vec<CString>,
    /// The directory trees to scan.
    pub roots: Vec<PathBuf>,
}

/// Runs the full pipeline on the configured roots.
///
/// The returned error is fatal and means no work has been done. Errors on
/// individual files are reported on stderr and never interrupt the run.
pub fn run(config: &Config) -> io::Result<Stats> {
    let mut out = Output::new(config);
    let mut inodes = scan::scan(config, &mut out)?;
    let queue = group::size_classes(&inodes);
    let digests = hash::hash_all(config, &mut inodes, &queue, &mut out);
    let buckets = group::digest_buckets(digests);
    Ok(relink::relink_all(config, &inodes, &buckets, &mut out))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempdir::TempDir;

    fn write_file(path: &Path, content: &[u8], mtime_sec: u64) {
        fs::write(path, content).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_sec))
            .unwrap();
    }

    fn config_for(root: &Path) -> Config {
        Config {
            roots: vec![root.to_path_buf()],
            ..Default::default()
        }
    }

    #[test]
    fn simple_duplicate() {
        let dir = TempDir::new("dedupe").unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, b"data", 100);
        write_file(&b, b"data", 200);
        let a_ino = fs::metadata(&a).unwrap().ino();

        let stats = run(&config_for(dir.path())).unwrap();
        assert_eq!(stats.relinks, 1);
        assert_eq!(stats.saved, 4);

        // the oldest file is the canonical copy
        let a_meta = fs::metadata(&a).unwrap();
        let b_meta = fs::metadata(&b).unwrap();
        assert_eq!(a_meta.ino(), a_ino);
        assert_eq!(b_meta.ino(), a_ino);
        assert_eq!(a_meta.nlink(), 2);
        assert_eq!(fs::read(&b).unwrap(), b"data");
    }

    #[test]
    fn existing_hard_links_coalesce() {
        let dir = TempDir::new("dedupe").unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        let d = dir.path().join("d");
        write_file(&a, b"X", 100);
        fs::hard_link(&a, &b).unwrap();
        write_file(&c, b"X", 200);
        write_file(&d, b"X", 300);
        let x_ino = fs::metadata(&a).unwrap().ino();

        let stats = run(&config_for(dir.path())).unwrap();
        assert_eq!(stats.relinks, 2);
        assert_eq!(stats.saved, 2);

        for path in [&a, &b, &c, &d] {
            assert_eq!(fs::metadata(path).unwrap().ino(), x_ino);
        }
        assert_eq!(fs::metadata(&a).unwrap().nlink(), 4);
    }

    #[test]
    fn excluded_subtree_is_not_visited() {
        let dir = TempDir::new("dedupe").unwrap();
        fs::create_dir(dir.path().join("keep")).unwrap();
        fs::create_dir(dir.path().join("skip")).unwrap();
        write_file(&dir.path().join("keep/x"), b"same", 100);
        write_file(&dir.path().join("skip/x"), b"same", 200);

        let mut config = config_for(dir.path());
        config.excludes.push(CString::new("skip").unwrap());
        let stats = run(&config).unwrap();
        assert_eq!(stats.relinks, 0);
        assert_eq!(stats.saved, 0);
    }

    #[test]
    fn dry_run_leaves_the_tree_alone() {
        let dir = TempDir::new("dedupe").unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, b"data", 100);
        write_file(&b, b"data", 200);

        let mut config = config_for(dir.path());
        config.dry_run = true;
        let stats = run(&config).unwrap();
        assert_eq!(stats.relinks, 0);
        assert_ne!(
            fs::metadata(&a).unwrap().ino(),
            fs::metadata(&b).unwrap().ino()
        );
    }

    #[test]
    fn second_run_is_a_no_op() {
        let dir = TempDir::new("dedupe").unwrap();
        write_file(&dir.path().join("a"), b"data", 100);
        write_file(&dir.path().join("b"), b"data", 200);

        let config = config_for(dir.path());
        let first = run(&config).unwrap();
        assert_eq!(first.relinks, 1);
        let second = run(&config).unwrap();
        assert_eq!(second, Stats::default());
    }

    #[test]
    fn zero_byte_files_coalesce() {
        let dir = TempDir::new("dedupe").unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        write_file(&a, b"", 100);
        write_file(&b, b"", 200);
        write_file(&c, b"", 300);

        let stats = run(&config_for(dir.path())).unwrap();
        assert_eq!(stats.relinks, 2);
        assert_eq!(stats.saved, 0);
        assert_eq!(fs::metadata(&a).unwrap().nlink(), 3);
    }
}
