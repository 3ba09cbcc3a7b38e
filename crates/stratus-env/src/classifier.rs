//! Path classification by file role
//!
//! The role of a database file is derived from its name alone and never
//! stored. Table files end in `.sst`; write-ahead log segments end in `.log`
//! and descriptor logs start with `MANIFEST`. Everything else (identity,
//! options, lock and temp files) is passed through to the local filesystem.

/// Suffix of sorted table files
pub const TABLE_SUFFIX: &str = ".sst";

/// Suffix of write-ahead log segments
pub const LOG_SUFFIX: &str = ".log";

/// Prefix of descriptor log segments
pub const DESCRIPTOR_PREFIX: &str = "MANIFEST";

/// Role of a database file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileRole {
    /// Immutable sorted table produced by flush or compaction
    TableFile,
    /// Append-only log segment
    LogSegment,
    /// Anything else
    Other,
}

/// Classify a path by its final component
pub fn classify(path: &str) -> FileRole {
    let name = basename(path);
    if name.ends_with(TABLE_SUFFIX) {
        FileRole::TableFile
    } else if name.ends_with(LOG_SUFFIX) || name.starts_with(DESCRIPTOR_PREFIX) {
        FileRole::LogSegment
    } else {
        FileRole::Other
    }
}

/// Final component of a path, ignoring trailing separators
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Everything before the final component, or `""`
pub fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(i) => &trimmed[..i],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("/db/000010.sst", FileRole::TableFile)]
    #[case("000010.sst", FileRole::TableFile)]
    #[case("/db/000003.log", FileRole::LogSegment)]
    #[case("/db/MANIFEST-000005", FileRole::LogSegment)]
    #[case("/db/CURRENT", FileRole::Other)]
    #[case("/db/IDENTITY", FileRole::Other)]
    #[case("/db/LOCK", FileRole::Other)]
    #[case("/db/OPTIONS-000007", FileRole::Other)]
    #[case("/db/000010.sst.tmp", FileRole::Other)]
    #[case("/db.sst/CURRENT", FileRole::Other)]
    #[case("", FileRole::Other)]
    fn test_classify(#[case] path: &str, #[case] role: FileRole) {
        assert_eq!(classify(path), role);
    }

    #[rstest]
    #[case("/a/b/c", "c", "/a/b")]
    #[case("/a/", "a", "/")]
    #[case("c", "c", "")]
    fn test_path_components(#[case] path: &str, #[case] base: &str, #[case] dir: &str) {
        assert_eq!(basename(path), base);
        assert_eq!(dirname(path), dir);
    }

    proptest! {
        #[test]
        fn classification_is_total_and_stable(path in ".*") {
            let first = classify(&path);
            prop_assert!(matches!(
                first,
                FileRole::TableFile | FileRole::LogSegment | FileRole::Other
            ));
            for _ in 0..3 {
                prop_assert_eq!(classify(&path), first);
            }
        }

        #[test]
        fn classification_ignores_directories(dir in "[a-z/]{0,12}", name in "[0-9]{6}\\.(sst|log)") {
            let joined = format!("{}/{}", dir, name);
            prop_assert_eq!(classify(&joined), classify(&name));
        }
    }
}
