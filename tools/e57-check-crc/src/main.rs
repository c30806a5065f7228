/*
 * Small tool that validates the page checksums of E57 files.
 * If the argument is a file path, it will check a single file.
 * If the argument is a directory, it will recursively check all E57 files in that directory.
 * Set RUST_LOG=debug to see more details.
 */

use anyhow::{bail, ensure, Context, Result};
use e57_codec::{validate_checksums, ImageFile};
use env_logger::{Builder, Env};
use log::{debug, error, info};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    ensure!(
        args.len() >= 2,
        "Usage:\n  e57-check-crc <path/to/my.e57>\n  e57-check-crc <path/to/folder/>"
    );

    let path = Path::new(&args[1]);
    ensure!(path.exists(), "The path '{}' does not exist", path.display());

    let all_ok = if path.is_dir() {
        let files = list_e57_files(path).context("Failed to list E57 files")?;
        info!("Found {} files, starting validation...", files.len());
        files.iter().fold(true, |ok, f| check_file(f) && ok)
    } else if path.is_file() {
        check_file(path)
    } else {
        bail!(
            "The path '{}' does not point to a directory or a file",
            path.display()
        );
    };

    if !all_ok {
        bail!("Some of the checked files are not okay")
    }

    info!("All files are okay!");
    Ok(())
}

fn list_e57_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut res = Vec::new();
    let entries = path
        .read_dir()
        .with_context(|| format!("Failed to read directory '{}'", path.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            let is_e57 = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("e57"));
            if is_e57 {
                res.push(path);
            }
        } else if path.is_dir() {
            res.append(&mut list_e57_files(&path)?);
        }
    }
    Ok(res)
}

fn check_file(path: &Path) -> bool {
    match validate_file(path) {
        Ok(pages) => {
            info!("Validated {pages} pages of '{}' successfully", path.display());
            true
        }
        Err(err) => {
            error!("Failed to validate file '{}': {err:#}", path.display());
            false
        }
    }
}

/// Checks all page checksums and then makes sure header and XML section can be parsed.
fn validate_file(path: &Path) -> Result<u64> {
    let file = File::open(path).context("Failed to open file")?;
    let pages = validate_checksums(BufReader::new(file))?;
    let image = ImageFile::open(path)?;
    let tree = image.tree()?;
    debug!(
        "File '{}' has {} registered extensions",
        path.display(),
        tree.extensions().len()
    );
    Ok(pages)
}
