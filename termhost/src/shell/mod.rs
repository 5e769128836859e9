//! Pseudo-terminal and child process plumbing.
//!
//! - [`pty`]: allocate a master, name and open its slave, line settings,
//!   window size.
//! - [`process`]: start a program with the slave as its controlling terminal,
//!   signal its process group, reap it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub mod process;
pub mod pty;

/// Shell used when nothing else is configured.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Detect available shells on this system.
///
/// Reads `/etc/shells` first (filtering comments and blank lines), then falls
/// back to probing a hardcoded list of common paths.  Results are deduplicated
/// by canonical path (so `/bin/bash` and `/usr/bin/bash` don't both appear when
/// one is a symlink) and sorted by preference: zsh > fish > bash > dash > ash > sh.
pub fn detect_shells() -> Vec<String> {
    let candidates = match std::fs::read_to_string("/etc/shells") {
        Ok(contents) => {
            let from_file = parse_shells(&contents);
            if from_file.is_empty() {
                fallback_candidates()
            } else {
                from_file
            }
        }
        Err(_) => fallback_candidates(),
    };

    let mut seen = HashSet::new();
    let mut shells: Vec<String> = candidates
        .into_iter()
        .filter(|p| {
            let canonical = std::fs::canonicalize(p).unwrap_or_else(|_| PathBuf::from(p));
            seen.insert(canonical)
        })
        .collect();

    shells.sort_by_key(|s| shell_rank(s));
    shells
}

/// The program a session runs when none is given.
///
/// `$SHELL` wins if it names an existing file, then the most preferred
/// detected shell, then [`FALLBACK_SHELL`].
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() && Path::new(&shell).exists() {
            return shell;
        }
    }
    detect_shells()
        .into_iter()
        .next()
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

fn parse_shells(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| Path::new(l).exists())
        .map(ToString::to_string)
        .collect()
}

fn fallback_candidates() -> Vec<String> {
    [
        "/bin/sh",
        "/bin/bash",
        "/bin/zsh",
        "/bin/ash",
        "/bin/dash",
        "/usr/bin/fish",
        "/usr/bin/zsh",
        "/usr/bin/bash",
    ]
    .iter()
    .filter(|p| Path::new(p).exists())
    .map(|p| (*p).to_string())
    .collect()
}

/// Rank shells from most preferred (0) to least (6).
fn shell_rank(path: &str) -> u8 {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name {
        "zsh" => 0,
        "fish" => 1,
        "bash" => 2,
        "dash" => 3,
        "ash" => 4,
        "sh" => 5,
        _ => 6,
    }
}
