use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use tempfile::TempDir;

use crate::{error::Result, runner::Staged, submission::check_file_name};

/// Scratch directory for one attempt at one submission. Removed on drop.
#[derive(Debug)]
pub struct WorkerSlot {
    dir: TempDir,
    name: String,
    root: PathBuf,
}

impl WorkerSlot {
    pub fn create(root: &Path, submission_id: &str, attempt: u32) -> Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("slot-{}-{}-", sanitize(submission_id), attempt))
            .tempdir_in(root)?;
        fs::create_dir(dir.path().join(".tmp"))?;

        let dirname = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        debug!("created slot {}", dir.path().display());
        Ok(Self {
            name: format!("sandpit-{}", dirname),
            dir,
            root: root.to_path_buf(),
        })
    }

    /// Unique name, also used for the container of each phase.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.dir.path().join(".tmp")
    }

    /// Directory every slot of this pool lives under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, staged: &Staged) -> Result<()> {
        for file in &staged.files {
            check_file_name(&file.name)?;
            fs::write(self.path().join(&file.name), &file.content)?;
        }
        Ok(())
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        debug!("removing slot {}", self.dir.path().display());
        if let Err(e) = fs::remove_dir_all(self.dir.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove slot {}: {}", self.dir.path().display(), e);
            }
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .take(32)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
