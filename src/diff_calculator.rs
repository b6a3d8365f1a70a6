use std::collections::{BTreeMap, BTreeSet};

use crate::digester::{Checksum, ChecksumMap};

/// Partition of two trees' paths.
///
/// The four key sets are pairwise disjoint and together cover every path of
/// both trees.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffResult {
    /// Only in the old tree, with the old checksum.
    pub files_to_delete: BTreeMap<String, Checksum>,
    /// Only in the new tree.
    pub files_to_create: BTreeSet<String>,
    /// In both trees with different content, keyed to the old checksum.
    pub files_to_update: BTreeMap<String, Checksum>,
    /// In both trees with the same content.
    pub common_files: BTreeMap<String, Checksum>,
}

pub fn calculate(old_checksums: &ChecksumMap, new_checksums: &ChecksumMap) -> DiffResult {
    let mut result = DiffResult::default();

    for (path, &old) in old_checksums {
        match new_checksums.get(path) {
            None => {
                result.files_to_delete.insert(path.clone(), old);
            }
            Some(&new) if new == old => {
                result.common_files.insert(path.clone(), old);
            }
            Some(_) => {
                result.files_to_update.insert(path.clone(), old);
            }
        }
    }

    result.files_to_create = new_checksums
        .keys()
        .filter(|path| !old_checksums.contains_key(*path))
        .cloned()
        .collect();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Checksum)]) -> ChecksumMap {
        entries.iter().map(|(p, c)| (p.to_string(), *c)).collect()
    }

    #[test]
    fn test_create_delete_and_common() {
        let old = map(&[("a.txt", 1), ("b.txt", 2)]);
        let new = map(&[("b.txt", 2), ("c.txt", 3)]);

        let diff = calculate(&old, &new);

        assert_eq!(diff.files_to_delete, map(&[("a.txt", 1)]));
        assert_eq!(diff.files_to_create, BTreeSet::from(["c.txt".to_string()]));
        assert!(diff.files_to_update.is_empty());
        assert_eq!(diff.common_files, map(&[("b.txt", 2)]));
    }

    #[test]
    fn test_update_keeps_old_checksum() {
        let diff = calculate(&map(&[("x", 1)]), &map(&[("x", 5)]));

        assert_eq!(diff.files_to_update, map(&[("x", 1)]));
        assert!(diff.files_to_delete.is_empty());
        assert!(diff.files_to_create.is_empty());
        assert!(diff.common_files.is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        let diff = calculate(&ChecksumMap::new(), &ChecksumMap::new());
        assert_eq!(diff, DiffResult::default());
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        // Small deterministic generator so the property is checked on many shapes.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..200 {
            let mut old = ChecksumMap::new();
            let mut new = ChecksumMap::new();
            for i in 0..(next() % 12) {
                old.insert(format!("f{}", next() % 16), next() % 3 + i % 2);
            }
            for i in 0..(next() % 12) {
                new.insert(format!("f{}", next() % 16), next() % 3 + i % 2);
            }

            let diff = calculate(&old, &new);

            let delete: BTreeSet<&String> = diff.files_to_delete.keys().collect();
            let create: BTreeSet<&String> = diff.files_to_create.iter().collect();
            let update: BTreeSet<&String> = diff.files_to_update.keys().collect();
            let common: BTreeSet<&String> = diff.common_files.keys().collect();

            let sets = [&delete, &create, &update, &common];
            for (i, a) in sets.iter().enumerate() {
                for b in sets.iter().skip(i + 1) {
                    assert!(a.is_disjoint(b), "sets overlap: {:?} / {:?}", a, b);
                }
            }

            let union: BTreeSet<&String> = sets.iter().flat_map(|s| s.iter().copied()).collect();
            let expected: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            assert_eq!(union, expected);

            for (path, checksum) in &diff.files_to_update {
                assert_eq!(old[path], *checksum);
                assert_ne!(new[path], *checksum);
            }
        }
    }
}
