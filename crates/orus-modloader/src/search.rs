//! Module-name normalization and search-root enumeration.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// What kind of root a path came from, used both for the module cache key
/// and for the diagnostic listing a failed resolution reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootKind {
    /// The directory containing the file that issued the `use`.
    Importer,
    /// The running executable's own directory (or its `..` when the
    /// executable lives in a `bin/` next to a sibling `std/`).
    Executable,
    /// A hardcoded platform-specific install location.
    Platform,
    /// An entry from the `ORUSPATH` environment variable.
    OrusPath,
}

impl RootKind {
    /// The label used in resolver diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            RootKind::Importer => "importer directory",
            RootKind::Executable => "executable directory",
            RootKind::Platform => "platform fallback",
            RootKind::OrusPath => "ORUSPATH entry",
        }
    }
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One directory to check a normalized module path against, tagged with the
/// reason it's in the list.
#[derive(Clone, Debug)]
pub struct SearchRoot {
    /// The directory itself.
    pub path: PathBuf,
    /// Why this directory is a candidate.
    pub kind: RootKind,
}

/// Maps a dotted `use` path (or bare standard-library name) to the relative
/// `.orus` file path search roots are joined against. `a.b.c` becomes
/// `a/b/c.orus`; a name with no `.` separator is standard-library and is
/// prefixed with `std/` (`io` becomes `std/io.orus`).
pub fn normalize_module_name(name: &str) -> String {
    if name.contains('.') {
        format!("{}.orus", name.replace('.', "/"))
    } else {
        format!("std/{name}.orus")
    }
}

/// The ordered list of directories to check for a module imported by
/// `importer_path` (the resolved path of the file doing the importing, or
/// `"<repl>"` for input with no backing file). Reads `ORUSPATH` fresh on
/// every call; [`search_roots_with`] takes a caller-supplied list instead,
/// for hosts that read `ORUSPATH` once up front.
pub fn search_roots(importer_path: &str) -> Vec<SearchRoot> {
    search_roots_with(importer_path, &oruspath_from_env())
}

/// Same search as [`search_roots`], but with the `ORUSPATH` entries supplied
/// by the caller instead of re-read from the environment.
pub fn search_roots_with(importer_path: &str, oruspath: &[PathBuf]) -> Vec<SearchRoot> {
    let mut roots = Vec::new();

    if importer_path != "<repl>" {
        if let Some(dir) = Path::new(importer_path).parent() {
            if !dir.as_os_str().is_empty() {
                roots.push(SearchRoot { path: dir.to_path_buf(), kind: RootKind::Importer });
            }
        }
    }

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            roots.push(SearchRoot { path: dir.to_path_buf(), kind: RootKind::Executable });
            if dir.file_name().is_some_and(|n| n == "bin") {
                if let Some(up) = dir.parent() {
                    if up.join("std").is_dir() {
                        roots.push(SearchRoot { path: up.to_path_buf(), kind: RootKind::Executable });
                    }
                }
            }
        }
    }

    for fallback in platform_fallbacks() {
        roots.push(SearchRoot { path: PathBuf::from(fallback), kind: RootKind::Platform });
    }

    for entry in oruspath {
        roots.push(SearchRoot { path: entry.clone(), kind: RootKind::OrusPath });
    }

    roots
}

/// Splits `ORUSPATH` the way the environment variable is documented: `:`-
/// separated on POSIX, `;`-separated on Windows.
pub fn oruspath_from_env() -> Vec<PathBuf> {
    let Ok(value) = env::var("ORUSPATH") else {
        return Vec::new();
    };
    let sep = if cfg!(windows) { ';' } else { ':' };
    value.split(sep).filter(|s| !s.is_empty()).map(PathBuf::from).collect()
}

fn platform_fallbacks() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["/Library/Orus", "/Library/Orus/latest"]
    } else if cfg!(windows) {
        &["C:/Program Files/Orus", "C:/Program Files (x86)/Orus"]
    } else {
        &["/usr/local/lib/orus", "/usr/lib/orus"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dotted_names_map_to_slash_separated_paths() {
        assert_eq!(normalize_module_name("a.b.c"), "a/b/c.orus");
    }

    #[test]
    fn bare_names_are_treated_as_standard_library() {
        assert_eq!(normalize_module_name("io"), "std/io.orus");
    }

    #[test]
    fn repl_importer_contributes_no_importer_root() {
        let roots = search_roots("<repl>");
        assert!(roots.iter().all(|r| r.kind != RootKind::Importer));
    }
}
