//! src/services/namespace.rs
//!
//! Maps untrusted, user-supplied directory and object paths onto safe
//! relative locations beneath the storage root, and produces the date shard
//! (`YYYY/MM/DD`) that new uploads are placed under.

use chrono::{Local, NaiveDate};
use std::path::PathBuf;

/// Name prefix reserved for directories created by zip extraction.
pub const ARCHIVE_DIR_PREFIX: &str = "_zip_";

/// Directory (directly under the root) that holds key-value blobs.
pub const KVS_DIR_NAME: &str = "_kvs_";

/// Split a raw path into the segments that survive sanitizing.
///
/// Empty segments (double, leading or trailing slashes) and segments made
/// only of dots (`.`, `..`, `...`) are dropped rather than resolved, so no
/// sequence of segments can climb above the root. Backslashes count as
/// separators as well.
fn clean_segments(v: &str) -> impl Iterator<Item = &str> {
    v.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .filter(|segment| !segment.bytes().all(|b| b == b'.'))
        .filter(|segment| !segment.contains('\0'))
}

/// Sanitize `v` into a relative filesystem path joined with the OS separator.
///
/// The result is always relative and never contains a `..` component.
/// Empty input yields an empty path.
pub fn to_fs_path(v: &str) -> PathBuf {
    clean_segments(v).collect()
}

/// Sanitize `v` the same way as [`to_fs_path`] but join with `/`.
pub fn to_url_path(v: &str) -> String {
    clean_segments(v).collect::<Vec<_>>().join("/")
}

/// Today's local calendar date as `YYYY/MM/DD`.
pub fn date_shard_path() -> String {
    date_shard_path_for(Local::now().date_naive())
}

pub fn date_shard_path_for(date: NaiveDate) -> String {
    date.format("%Y/%m/%d").to_string()
}

/// True when the final component of `name` marks an extracted archive.
pub fn is_archive_dir_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_DIR_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Component, Path};

    fn join(parts: &[&str]) -> PathBuf {
        parts.iter().collect()
    }

    #[test]
    fn fs_path_normalization_table() {
        let cases: &[(&str, &str, PathBuf)] = &[
            ("slash", "asd/dsa/qwe", join(&["asd", "dsa", "qwe"])),
            ("without slash", "asd", join(&["asd"])),
            ("empty string", "", PathBuf::new()),
            ("double slash", "asd//dsa/qwe", join(&["asd", "dsa", "qwe"])),
            ("slash prefix", "/asd/dsa/qwe", join(&["asd", "dsa", "qwe"])),
            ("slash suffix", "asd/dsa/qwe/", join(&["asd", "dsa", "qwe"])),
            ("parent dir 1", "../../dsa/qwe/", join(&["dsa", "qwe"])),
            (
                "parent dir 2",
                "dsa/qwe/../../../../asd",
                join(&["dsa", "qwe", "asd"]),
            ),
            ("dot 1", "dsa/qwe/./asd", join(&["dsa", "qwe", "asd"])),
            ("dot 2", "dsa/qwe/asd/.", join(&["dsa", "qwe", "asd"])),
            ("dot 3", "./dsa/qwe/asd", join(&["dsa", "qwe", "asd"])),
            (
                "dot 4",
                ".../dsa/./../qwe/.../asd/...",
                join(&["dsa", "qwe", "asd"]),
            ),
            ("backslash", "..\\..\\etc\\passwd", join(&["etc", "passwd"])),
        ];

        for (name, input, want) in cases {
            assert_eq!(&to_fs_path(input), want, "case `{name}`");
        }
    }

    #[test]
    fn fs_path_never_escapes_root() {
        let inputs = [
            "../../../../etc/passwd",
            "a/../../b",
            "/..",
            "....//....//x",
            "./././",
            "a\\..\\..\\b",
        ];
        let root = Path::new("/srv/files");
        for input in inputs {
            let rel = to_fs_path(input);
            assert!(
                rel.components().all(|c| matches!(c, Component::Normal(_))),
                "`{input}` produced {rel:?}"
            );
            assert!(root.join(&rel).starts_with(root));
        }
    }

    #[test]
    fn url_path_uses_forward_slash() {
        assert_eq!(to_url_path("/photos//2024/"), "photos/2024");
        assert_eq!(to_url_path("a/../b/./c"), "a/b/c");
        assert_eq!(to_url_path(""), "");
    }

    #[test]
    fn date_shard_format() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(date_shard_path_for(date), "2024/03/07");
        assert_eq!(date_shard_path().len(), "YYYY/MM/DD".len());
    }

    #[test]
    fn archive_prefix_detection() {
        assert!(is_archive_dir_name("_zip_abc"));
        assert!(!is_archive_dir_name("q_zip_abc"));
        assert!(!is_archive_dir_name("photos"));
    }
}
