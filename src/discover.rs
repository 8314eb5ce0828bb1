use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::VIDEO_EXTENSIONS;
use crate::error::{Error, Result};

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Expand files and directories into an ordered, deduplicated list of
/// absolute video paths.
///
/// Directories are walked recursively in file-name order. A named file with an
/// unsupported extension is skipped with a warning; a path that does not exist
/// fails the whole call before anything is walked.
pub fn discover_videos<P: AsRef<Path>>(inputs: &[P]) -> Result<Vec<PathBuf>> {
    if inputs.is_empty() {
        return Err(Error::NoInputProvided);
    }

    for input in inputs {
        let input = input.as_ref();
        if fs::symlink_metadata(input).is_err() {
            return Err(Error::PathNotFound {
                path: input.to_path_buf(),
            });
        }
    }

    let mut seen = HashSet::new();
    let mut videos = Vec::new();
    let mut push = |path: &Path| -> Result<()> {
        let absolute = fs::canonicalize(path)?;
        if seen.insert(absolute.clone()) {
            videos.push(absolute);
        } else {
            debug!("Dropping duplicate input {}", path.display());
        }
        Ok(())
    };

    for input in inputs {
        let input = input.as_ref();
        if input.is_dir() {
            let matching = WalkDir::new(input)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Skipping unreadable entry under {}: {}", input.display(), e);
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file() && is_video(entry.path()));
            for entry in matching {
                push(entry.path())?;
            }
        } else if input.is_file() && is_video(input) {
            push(input)?;
        } else {
            warn!("Skipping unsupported: {}", input.display());
        }
    }

    Ok(videos)
}
