use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_NON_EMPTY_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "yaml", "toml"];

/// Never scanned: build output, vendored trees, and reference material.
const SKIPPED_DIRS: &[&str] = &["target", ".git", "node_modules", "examples"];

const SKIPPED_FILES: &[&str] = &["Cargo.lock"];

struct Violation {
    path: PathBuf,
    line: Option<usize>,
    detail: String,
}

fn main() {
    for git_file in [".git/HEAD", ".git/refs/heads/main", ".git/packed-refs"] {
        println!("cargo:rerun-if-changed={}", git_file);
    }
    println!("cargo:rustc-env=WORKFLOW_ENGINE_GIT_SHA={}", git_sha());

    let root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => panic!("CARGO_MANIFEST_DIR is not set"),
    };
    let files = tracked_files(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    report(
        &format!("FILES OVER {} NON-EMPTY LINES", MAX_NON_EMPTY_LINES),
        "Split the file into smaller modules.",
        oversized_files(&root, &files),
    );
    report(
        "#[allow(dead_code)] IS NOT ALLOWED",
        "Delete unused code, or gate test-only helpers behind #[cfg(test)].",
        dead_code_allows(&root, &files),
    );
    report(
        "ENV MUTATIONS REQUIRE #[serial]",
        "Tests that set or remove env vars must run serially.",
        unserialized_env_tests(&root, &files),
    );
}

fn git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn report(title: &str, hint: &str, violations: Vec<Violation>) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n== {} ==", title);
    for violation in &violations {
        match violation.line {
            Some(line) => eprintln!("  {}:{}  {}", violation.path.display(), line, violation.detail),
            None => eprintln!("  {}  {}", violation.path.display(), violation.detail),
        }
    }
    eprintln!("{}\n", hint);
    panic!("Build failed: {} ({} occurrence(s))", title, violations.len());
}

fn oversized_files(root: &Path, files: &[PathBuf]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let content = match std::fs::read_to_string(file) {
            Ok(content) => content,
            Err(err) => {
                println!("cargo:warning=Could not read {}: {}", relative(root, file).display(), err);
                continue;
            }
        };
        let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
        if lines > MAX_NON_EMPTY_LINES {
            violations.push(Violation {
                path: relative(root, file),
                line: None,
                detail: format!("{} lines ({} over)", lines, lines - MAX_NON_EMPTY_LINES),
            });
        }
    }
    violations
}

fn dead_code_allows(root: &Path, files: &[PathBuf]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (file, content) in rust_sources(files) {
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            let is_allow = trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow(");
            if is_allow && trimmed.contains("dead_code") {
                violations.push(Violation {
                    path: relative(root, file),
                    line: Some(index + 1),
                    detail: trimmed.to_string(),
                });
            }
        }
    }
    violations
}

/// Flags `#[test]`/`#[tokio::test]` functions that touch env vars without
/// a preceding `#[serial]`.
fn unserialized_env_tests(root: &Path, files: &[PathBuf]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (file, content) in rust_sources(files) {
        let lines: Vec<&str> = content.lines().collect();
        let mut serial_pending = false;
        let mut index = 0;
        while index < lines.len() {
            let trimmed = lines[index].trim();
            if is_serial_attr(trimmed) {
                serial_pending = true;
            }
            let is_test = trimmed == "#[test]" || trimmed.starts_with("#[tokio::test");
            if !is_test {
                index += 1;
                continue;
            }

            let start = index + 1;
            let body = test_body(&lines, start);
            let signature = lines[start..]
                .iter()
                .take(5)
                .position(|l| l.contains("fn "))
                .map_or(start, |offset| start + offset);
            let serial = serial_pending
                || lines[start..signature].iter().any(|l| is_serial_attr(l.trim()));
            let name = lines
                .get(signature)
                .and_then(|l| l.split("fn ").nth(1))
                .and_then(|rest| rest.split('(').next())
                .unwrap_or("?")
                .trim()
                .to_string();
            let mutates_env = lines[body.clone()].iter().any(|l| {
                let l = l.trim();
                !l.starts_with("//") && (l.contains("env::set_var") || l.contains("env::remove_var"))
            });
            if mutates_env && !serial {
                violations.push(Violation {
                    path: relative(root, file),
                    line: Some(start),
                    detail: format!("test `{}` mutates env without #[serial]", name),
                });
            }
            serial_pending = false;
            index = body.end.max(index + 1);
        }
    }
    violations
}

fn is_serial_attr(line: &str) -> bool {
    line == "#[serial]" || line == "#[serial_test::serial]"
}

/// Line range of the function that starts at or after `start`, by brace depth.
fn test_body(lines: &[&str], start: usize) -> std::ops::Range<usize> {
    let mut depth = 0i32;
    let mut opened = false;
    for (offset, line) in lines[start..].iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return start..start + offset + 1;
        }
    }
    start..lines.len()
}

fn rust_sources(files: &[PathBuf]) -> impl Iterator<Item = (&PathBuf, String)> {
    files
        .iter()
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("rs")
                && p.file_name().and_then(|n| n.to_str()) != Some("build.rs")
        })
        .filter_map(|p| std::fs::read_to_string(p).ok().map(|content| (p, content)))
}

/// Files under version control, or a directory walk outside a git checkout.
fn tracked_files(root: &Path) -> Vec<PathBuf> {
    let listed = Command::new("git")
        .arg("ls-files")
        .current_dir(root)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|stdout| {
            stdout
                .lines()
                .map(|line| root.join(line))
                .filter(|path| is_checked(path, root))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !listed.is_empty() {
        return listed;
    }

    let mut files = Vec::new();
    walk(root, root, &mut files);
    files
}

fn walk(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            let skipped = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| SKIPPED_DIRS.contains(&name));
            if !skipped {
                walk(&path, root, files);
            }
        } else if is_checked(&path, root) {
            files.push(path);
        }
    }
}

fn is_checked(path: &Path, root: &Path) -> bool {
    let checked_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CHECKED_EXTENSIONS.contains(&ext));
    if !checked_ext {
        return false;
    }
    let Ok(rel) = path.strip_prefix(root) else {
        return true;
    };
    if SKIPPED_FILES.iter().any(|skipped| rel.to_string_lossy() == *skipped) {
        return false;
    }
    !rel.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
    })
}

fn relative(root: &Path, file: &Path) -> PathBuf {
    file.strip_prefix(root).unwrap_or(file).to_path_buf()
}
