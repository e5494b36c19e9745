use std::fs;
use std::path::{Path, PathBuf};

const FORBIDDEN: &[&str] = &[".unwrap()", ".expect("];

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => panic!("failed to read {}: {err}", dir.display()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Everything above the first test module is production code.
fn production_section(source: &str) -> &str {
    match source.find("#[cfg(test)]") {
        Some(index) => &source[..index],
        None => source,
    }
}

#[test]
fn production_code_propagates_instead_of_panicking() {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut files = Vec::new();
    rust_files(&src_root, &mut files);
    files.sort();
    assert!(!files.is_empty());

    let mut offenders = Vec::new();
    for path in files {
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => panic!("failed to read {}: {err}", path.display()),
        };
        for (number, line) in production_section(&source).lines().enumerate() {
            if line.trim_start().starts_with("//") {
                continue;
            }
            if FORBIDDEN.iter().any(|marker| line.contains(marker)) {
                offenders.push(format!("{}:{}: {}", path.display(), number + 1, line.trim()));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "unwrap/expect outside tests:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn manifest_keeps_panic_lints_enabled() {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let manifest = match fs::read_to_string(manifest_dir.join("Cargo.toml")) {
        Ok(contents) => contents,
        Err(err) => panic!("package manifest must be readable: {err}"),
    };
    assert!(manifest.contains("[lints.clippy]"));
    assert!(manifest.contains("unwrap_used = \"warn\""));
    assert!(manifest.contains("expect_used = \"warn\""));
}
