//! The `dedupe` command finds regular files with identical content under the
//! given directories and replaces duplicates with hard links to a single
//! copy.

use std::env;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::exit;

use dedupe::Config;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The pipeline configuration.
    config: Config,
}

/// Strips trailing slashes from a root argument, keeping a lone `/` intact.
fn normalize_root(root: OsString) -> PathBuf {
    let bytes = root.as_bytes();
    let mut len = bytes.len();
    while len > 1 && bytes[len - 1] == b'/' {
        len -= 1;
    }
    PathBuf::from(OsStr::from_bytes(&bytes[..len]))
}

fn parse_args<A: Iterator<Item = OsString>>(mut args: A) -> Option<Args> {
    let mut res: Args = Default::default();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("-b" | "--boring") => res.config.boring = true,
            Some("-v" | "--verbose") => res.config.verbose = true,
            Some("-n" | "--dry-run") => res.config.dry_run = true,
            Some("-i" | "--interactive") => res.config.interactive = true,
            Some("-x" | "--use-xattrs") => res.config.use_xattrs = true,
            Some("-e" | "--exclude") => {
                let pattern = args.next()?;
                res.config
                    .excludes
                    .push(CString::new(pattern.as_bytes()).ok()?);
            }
            Some("-h" | "-?" | "--help") => res.help = true,
            Some(opt) if opt.len() > 1 && opt.starts_with('-') => return None,
            _ => res.config.roots.push(normalize_root(arg)),
        }
    }
    Some(res)
}

/// Prints command usage.
fn print_usage() {
    eprintln!("dedupe: bad usage");
    eprintln!("Try 'dedupe --help' for more information.");
}

/// Prints command help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" dedupe [options] [roots...]");
    println!();
    println!("Replaces duplicate files under the given directories with hard links to a");
    println!("single copy. The scan stays on the filesystem of the first root.");
    println!();
    println!("Options:");
    println!(" -b, --boring\t\tDisables colored output.");
    println!(" -v, --verbose\t\tPrints progress and duplicate reports.");
    println!(" -n, --dry-run\t\tReports duplicates without relinking anything.");
    println!(" -i, --interactive\tAsks before relinking each group of duplicates.");
    println!(" -x, --use-xattrs\tCaches content digests in extended attributes.");
    println!(" -e, --exclude PATTERN\tSkips entries whose name matches the glob pattern.");
    println!(" -h, --help\t\tPrints help.");
}

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(msg: M) -> ! {
    eprintln!("dedupe: error: {msg}");
    exit(1);
}

fn main() {
    let mut args = env::args_os();
    args.next();
    let Some(args) = parse_args(args) else {
        print_usage();
        exit(1);
    };
    if args.help {
        print_help();
        exit(0);
    }
    if args.config.roots.is_empty() {
        print_usage();
        exit(1);
    }
    if let Err(e) = dedupe::run(&args.config) {
        error(format_args!("{}: {e}", args.config.roots[0].display()));
    }
}
