use crate::entry::Entry;
use crate::Filesystem;
use wfs_error::{Result, WfsError};

/// Split a path into components: backslashes count as separators,
/// duplicate and trailing separators collapse.
pub(crate) fn components(path: &str) -> Vec<String> {
    path.replace('\\', "/")
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

pub(crate) fn name_matches(case_insensitive: bool, a: &str, b: &str) -> bool {
    if case_insensitive {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Walk `path` from the root, matching component names with the
/// filesystem's case rule.
pub(crate) fn resolve(fs: &Filesystem<'_>, path: &str) -> Result<Entry> {
    let case_insensitive = fs.case_insensitive();
    let mut current = fs.root_entry()?;

    for component in components(path) {
        if !current.is_dir() {
            return Err(WfsError::not_found(path));
        }
        let entries = fs.entries_of(&current)?;
        current = entries
            .iter()
            .find(|e| name_matches(case_insensitive, &e.meta.name, &component))
            .cloned()
            .ok_or_else(|| WfsError::not_found(path))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_normalise() {
        assert_eq!(components("/"), Vec::<String>::new());
        assert_eq!(components("//a///b/"), vec!["a", "b"]);
        assert_eq!(components("a\\b\\c"), vec!["a", "b", "c"]);
        assert_eq!(components("dir/data.bin"), vec!["dir", "data.bin"]);
    }

    #[test]
    fn matching_respects_case_rule() {
        assert!(name_matches(true, "HELLO.TXT", "hello.txt"));
        assert!(!name_matches(false, "HELLO.TXT", "hello.txt"));
        assert!(name_matches(false, "data.bin", "data.bin"));
    }
}
