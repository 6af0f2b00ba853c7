//! Index warmup: open a few central files right after the engine starts so
//! its background index begins with what the rest of the project includes.

use globset::{GlobBuilder, GlobMatcher};
use log::{debug, info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AnalysisError;
use crate::tiers::semantic::EngineSession;
use crate::workspace::{list_source_files, FilePattern};

/// Pause between two opens so the engine is not flooded at startup.
pub const WARMUP_PAUSE: Duration = Duration::from_millis(100);

const MAX_CANDIDATES: usize = 5000;

/// Patterns relative to the project root, most widely included first:
/// entry points, public headers, other headers, then implementation files.
const PRIORITIES: [&[&str]; 4] = [
    &[
        "main.cpp",
        "main.c",
        "main.cc",
        "src/main.cpp",
        "src/main.c",
        "app.cpp",
        "app.c",
    ],
    &[
        "include/**/*.h",
        "include/**/*.hpp",
        "include/**/*.hxx",
        "inc/**/*.h",
        "headers/**/*.h",
    ],
    &[
        "*.h", "*.hpp", "*.hxx", "src/*.h", "src/*.hpp", "lib/*.h", "lib/*.hpp",
    ],
    &[
        "*.cpp", "*.cc", "*.cxx", "*.c", "src/*.cpp", "src/*.cc", "src/*.c", "lib/*.cpp",
        "lib/*.cc", "lib/*.c",
    ],
];

#[derive(Deserialize)]
struct CompileEntry {
    #[serde(default)]
    directory: Option<PathBuf>,
    file: PathBuf,
}

/// Up to `limit` files worth opening first, in priority order.
///
/// With a compilation database, only files that are compiled, or that live
/// in a directory tree holding a compiled file, are kept.
pub fn key_files(root: &Path, compile_commands: Option<&Path>, limit: usize) -> Vec<PathBuf> {
    let candidates = match FilePattern::new("*") {
        Ok(any) => list_source_files(root, &any, MAX_CANDIDATES),
        Err(err) => {
            warn!("cannot list files for warmup: {err}");
            return Vec::new();
        }
    };

    let mut picked: Vec<PathBuf> = Vec::new();
    for pattern in PRIORITIES.iter().flat_map(|group| group.iter()) {
        let Some(matcher) = matcher(pattern) else { continue };
        for path in &candidates {
            let relative = path.strip_prefix(root).unwrap_or(path);
            if matcher.is_match(relative) && !picked.contains(path) {
                picked.push(path.clone());
            }
        }
    }

    if let Some(compiled) = compile_commands.and_then(|db| compiled_files(db, root)) {
        picked.retain(|path| {
            compiled.iter().any(|unit| {
                unit == path || unit.parent().is_some_and(|dir| path.starts_with(dir))
            })
        });
    }
    picked.truncate(limit);
    debug!("{} key files for warmup", picked.len());
    picked
}

/// Open `files` one after another. Returns how many the engine accepted.
pub async fn warm_up(session: &EngineSession, files: &[PathBuf], pause: Duration) -> usize {
    info!("warming up the engine index with {} files", files.len());
    let mut opened = 0;
    for file in files {
        match session.documents.ensure_open(&session.client, file).await {
            Ok(()) => opened += 1,
            Err(AnalysisError::ServiceUnavailable(reason)) => {
                warn!("index warmup stopped: {reason}");
                break;
            }
            Err(err) => debug!("warmup skipped {}: {err}", file.display()),
        }
        if opened > 0 && opened % 5 == 0 {
            info!("warmup progress: {opened}/{} files opened", files.len());
        }
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    info!("index warmup finished: {opened} files opened");
    opened
}

fn matcher(pattern: &str) -> Option<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| warn!("bad warmup pattern {pattern}: {err}"))
        .ok()
}

/// Absolute paths of the translation units listed in the compilation
/// database. `None` when it cannot be read or lists nothing.
fn compiled_files(db: &Path, root: &Path) -> Option<Vec<PathBuf>> {
    let text = fs::read_to_string(db)
        .map_err(|err| debug!("cannot read {}: {err}", db.display()))
        .ok()?;
    let entries: Vec<CompileEntry> = serde_json::from_str(&text)
        .map_err(|err| debug!("cannot parse {}: {err}", db.display()))
        .ok()?;
    if entries.is_empty() {
        return None;
    }
    Some(
        entries
            .into_iter()
            .map(|entry| {
                let file = if entry.file.is_absolute() {
                    entry.file
                } else {
                    entry
                        .directory
                        .unwrap_or_else(|| root.to_path_buf())
                        .join(entry.file)
                };
                file.canonicalize().unwrap_or(file)
            })
            .collect(),
    )
}
