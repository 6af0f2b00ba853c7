//! Project discovery and source file enumeration.
//!
//! ## Root detection priority
//!
//! 1. CLI argument (`--project`)
//! 2. Environment variable (`CLANGAROO_PROJECT`)
//! 3. Auto-detection via marker files, walking up from the current directory
//!
//! The build configuration (`compile_commands.json`) is looked up separately by
//! [`find_compile_commands`], since its absence only disables the semantic tier.

use anyhow::{bail, Result};
use blake3::Hasher;
use globset::{Glob, GlobMatcher};
use log::warn;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Environment variable for explicit project path
pub const ENV_PROJECT: &str = "CLANGAROO_PROJECT";

pub const COMPILE_COMMANDS: &str = "compile_commands.json";

/// Files that indicate a C/C++ project root, in priority order.
pub const PROJECT_MARKERS: &[&str] = &[
    COMPILE_COMMANDS,
    ".clangd",
    "CMakeLists.txt",
    "meson.build",
    "Makefile",
    ".git",
];

/// Build directories searched for `compile_commands.json`, after the root itself.
const BUILD_DIRS: &[&str] = &["build", "Build", "cmake-build-debug", "cmake-build-release"];

const SKIP_DIRS: &[&str] = &["build", "_build", "out", "node_modules", "target"];

pub const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx"];

/// Find the project root by walking up from a starting path.
///
/// Stops at the user's home directory.
pub fn find_project_root_from(start: &Path) -> Option<PathBuf> {
    let start = if start.is_absolute() {
        start.to_path_buf()
    } else {
        env::current_dir().ok()?.join(start)
    };
    let home = dirs::home_dir();

    let mut current = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start
    };

    loop {
        if has_project_marker(&current) {
            return Some(current);
        }
        if home.as_deref() == Some(current.as_path()) {
            return None;
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => return None,
        }
    }
}

fn has_project_marker(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

/// Resolve the project root with priority: CLI arg > env var > auto-detect.
pub fn resolve_project(cli_arg: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = cli_arg {
        return Ok(canonicalize_or_absolute(path));
    }

    if let Ok(env_path) = env::var(ENV_PROJECT) {
        return Ok(canonicalize_or_absolute(Path::new(&env_path)));
    }

    if let Some(root) = env::current_dir()
        .ok()
        .and_then(|cwd| find_project_root_from(&cwd))
    {
        return Ok(root);
    }

    bail!(
        "Could not detect project root.\n\n\
         Run from a directory containing compile_commands.json, CMakeLists.txt, .git/ or similar.\n\n\
         Or specify explicitly:\n\
         \x20 --project /path/to/project\n\
         \x20 {}=/path/to/project",
        ENV_PROJECT
    )
}

/// Canonicalize a path, or make it absolute if canonicalization fails.
pub fn canonicalize_or_absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(path)
        }
    })
}

/// Locate the directory holding `compile_commands.json`.
///
/// Order: project root, the well-known build directories, then any other
/// top-level directory whose name starts with `build`.
pub fn find_compile_commands(root: &Path) -> Option<PathBuf> {
    if root.join(COMPILE_COMMANDS).is_file() {
        return Some(root.to_path_buf());
    }
    for dir in BUILD_DIRS {
        let candidate = root.join(dir);
        if candidate.join(COMPILE_COMMANDS).is_file() {
            return Some(candidate);
        }
    }

    let mut extra: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("build") && !BUILD_DIRS.contains(&name.as_ref())
        })
        .map(|entry| entry.path())
        .collect();
    extra.sort();
    extra
        .into_iter()
        .find(|dir| dir.join(COMPILE_COMMANDS).is_file())
}

pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_c_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("c")
}

fn should_descend(entry: &DirEntry, root: &Path) -> bool {
    if entry.path() == root || !entry.file_type().is_dir() {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !(name.starts_with('.') || name.starts_with("cmake-build") || SKIP_DIRS.contains(&name.as_ref()))
}

/// File name glob, or a path glob relative to the project root when the pattern has a `/`.
#[derive(Debug, Clone)]
pub struct FilePattern {
    matcher: GlobMatcher,
    match_path: bool,
}

impl FilePattern {
    pub fn new(pattern: &str) -> Result<Self, globset::Error> {
        let pattern = if pattern.trim().is_empty() { "*" } else { pattern.trim() };
        Ok(Self {
            matcher: Glob::new(pattern)?.compile_matcher(),
            match_path: pattern.contains('/'),
        })
    }

    pub fn matches(&self, root: &Path, path: &Path) -> bool {
        if self.match_path {
            let rel = path.strip_prefix(root).unwrap_or(path);
            self.matcher.is_match(rel)
        } else {
            path.file_name()
                .map(|name| self.matcher.is_match(name))
                .unwrap_or(false)
        }
    }
}

/// List C/C++ source files under `root` matching `pattern`, sorted, at most `limit`.
pub fn list_source_files(root: &Path, pattern: &FilePattern, limit: usize) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| should_descend(e, root))
    {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!("walk error: {err}");
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_file() && is_source_file(path) && pattern.matches(root, path) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    files.truncate(limit);
    files
}

pub fn content_hash(contents: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(contents);
    hasher.finalize().to_hex().to_string()
}

/// blake3 hash of the file's current bytes.
pub fn file_hash(path: &Path) -> io::Result<String> {
    let contents = fs::read(path)?;
    Ok(content_hash(&contents))
}

pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Path relative to the project root for display, falling back to the full path.
pub fn display_path(root: &Path, path: &Path) -> String {
    normalize_path(path.strip_prefix(root).unwrap_or(path))
}
