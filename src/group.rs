//! Grouping of scanned inodes, first by file size, then by content digest.
//!
//! Both groupings obey the same rule: an equivalence class with a single
//! member cannot contain a duplicate and contributes no further work.

use std::collections::HashMap;

use crate::scan::FileInode;

/// Partitions the inodes by size and returns the hashing queue: every member
/// of a size class of cardinality at least two, sorted by size ascending with
/// ties broken by inode number.
///
/// The ascending order makes the per-file I/O grow monotonically, which keeps
/// the byte-completion ratio of the hash progress meaningful.
pub fn size_classes(inodes: &HashMap<u64, FileInode>) -> Vec<u64> {
    let mut classes: HashMap<u64, Vec<u64>> = HashMap::new();
    for inode in inodes.values() {
        classes.entry(inode.size).or_default().push(inode.ino);
    }
    let mut queue: Vec<u64> = classes
        .into_values()
        .filter(|class| class.len() >= 2)
        .flatten()
        .collect();
    queue.sort_unstable_by_key(|ino| (inodes[ino].size, *ino));
    queue
}

/// Sum of the sizes of the queued inodes, the denominator of the hash
/// progress ratio.
pub fn total_queued_bytes(inodes: &HashMap<u64, FileInode>, queue: &[u64]) -> u64 {
    queue.iter().map(|ino| inodes[ino].size).sum()
}

/// Keeps the digest buckets of cardinality at least two, ordered
/// lexicographically by digest bytes so output is stable across runs.
pub fn digest_buckets(map: HashMap<[u8; 32], Vec<u64>>) -> Vec<([u8; 32], Vec<u64>)> {
    let mut buckets: Vec<_> = map
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .collect();
    buckets.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    buckets
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::Mtime;

    fn inode(ino: u64, size: u64) -> FileInode {
        FileInode {
            dev: 1,
            ino,
            size,
            mtime: Mtime::default(),
            digest: None,
            paths: Vec::new(),
        }
    }

    fn inode_map(records: Vec<FileInode>) -> HashMap<u64, FileInode> {
        records.into_iter().map(|r| (r.ino, r)).collect()
    }

    #[test]
    fn singleton_sizes_are_dropped() {
        let inodes = inode_map(vec![inode(1, 4), inode(2, 4), inode(3, 7)]);
        assert_eq!(size_classes(&inodes), [1, 2]);
    }

    #[test]
    fn queue_is_ordered_by_size_then_inode() {
        let inodes = inode_map(vec![
            inode(9, 100),
            inode(2, 100),
            inode(5, 3),
            inode(7, 3),
        ]);
        assert_eq!(size_classes(&inodes), [5, 7, 2, 9]);
    }

    #[test]
    fn zero_sizes_are_grouped_too() {
        let inodes = inode_map(vec![inode(1, 0), inode(2, 0)]);
        let queue = size_classes(&inodes);
        assert_eq!(queue, [1, 2]);
        assert_eq!(total_queued_bytes(&inodes, &queue), 0);
    }

    #[test]
    fn queued_bytes_sum_over_the_whole_queue() {
        let inodes = inode_map(vec![inode(1, 10), inode(2, 10), inode(3, 10)]);
        let queue = size_classes(&inodes);
        assert_eq!(total_queued_bytes(&inodes, &queue), 30);
    }

    #[test]
    fn digest_buckets_drop_singletons_and_sort() {
        let mut map: HashMap<[u8; 32], Vec<u64>> = HashMap::new();
        map.insert([0xff; 32], vec![1, 2]);
        map.insert([0x00; 32], vec![3, 4, 5]);
        map.insert([0x7f; 32], vec![6]);

        let buckets = digest_buckets(map);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0], ([0x00; 32], vec![3, 4, 5]));
        assert_eq!(buckets[1], ([0xff; 32], vec![1, 2]));
    }
}
