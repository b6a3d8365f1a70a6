use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use super::{exists, read_executable_flag, restore, validate_access, validate_not_changed, Policy};
use crate::binary_diff;
use crate::binary_patch;
use crate::digester::Checksum;
use crate::error::PatchError;
use crate::multi_zip::{PayloadReader, PayloadWriter};
use crate::util;
use crate::validation::{Action, ResolutionOption, ValidationResult};

/// Change a file's content, either in place through a binary delta or by
/// relocating the bytes of another old file (a move).
///
/// `checksum` is the checksum `source` must have in the installation. For a
/// move the source is removed by its own delete action, which runs first;
/// the bytes are then taken from the backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAction {
    pub path: String,
    pub source: String,
    pub checksum: Checksum,
    pub is_move: bool,
    /// Ship the new file whole instead of a delta. Set for archives compared
    /// by content, whose installed bytes may differ from the old tree's.
    #[serde(skip)]
    whole_file: bool,
}

impl UpdateAction {
    pub fn new(path: impl Into<String>, checksum: Checksum) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            path,
            checksum,
            is_move: false,
            whole_file: false,
        }
    }

    pub fn moved(path: impl Into<String>, source: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            checksum,
            is_move: true,
            whole_file: false,
        }
    }

    pub fn whole_file(mut self, whole_file: bool) -> Self {
        self.whole_file = whole_file;
        self
    }

    fn action(&self) -> Action {
        if self.is_move {
            Action::Move
        } else {
            Action::Update
        }
    }

    /// Payload: executable flag byte, then the delta. Moves carry none.
    pub fn build_payload<W: Write + Seek>(
        &self,
        old_dir: &Path,
        new_dir: &Path,
        out: &mut PayloadWriter<'_, W>,
    ) -> Result<()> {
        if self.is_move {
            return Ok(());
        }
        let old_file = util::resolve(old_dir, &self.source);
        let new_file = util::resolve(new_dir, &self.path);

        let new_data = util::read_file_bytes(&new_file)?;
        let delta = if self.whole_file || binary_diff::is_incompressible(&self.path) {
            binary_diff::literal_delta(&new_data)
        } else {
            let old_data = util::read_file_bytes(&old_file)?;
            binary_diff::compute_delta(&old_data, &new_data)
        };

        out.put_next_entry(&self.path)?;
        out.write_all(&[util::is_executable(&new_file)? as u8])
            .context("Failed to write executable flag")?;
        binary_diff::write_delta(&delta, out)
            .with_context(|| format!("Failed to pack delta for {}", self.path))
    }

    pub fn validate(&self, to_dir: &Path, policy: &Policy) -> Option<ValidationResult> {
        let target = util::resolve(to_dir, &self.path);
        if let Some(result) = validate_access(policy, &self.path, &target, self.action()) {
            return Some(result);
        }
        validate_not_changed(
            policy,
            &self.path,
            &util::resolve(to_dir, &self.source),
            self.checksum,
            self.action(),
            vec![ResolutionOption::Skip],
        )
    }

    /// Where the old bytes are now: still in the installation, or in the
    /// backup directory if the source has already been deleted.
    fn source_file(&self, to_dir: &Path, backup_dir: &Path) -> PathBuf {
        let installed = util::resolve(to_dir, &self.source);
        if exists(&installed) {
            installed
        } else {
            util::resolve(backup_dir, &self.source)
        }
    }

    pub fn apply<R: Read + Seek>(
        &self,
        payloads: &mut PayloadReader<'_, R>,
        to_dir: &Path,
        backup_dir: &Path,
    ) -> Result<()> {
        let source = self.source_file(to_dir, backup_dir);
        let target = util::resolve(to_dir, &self.path);

        let (updated, executable) = if self.is_move {
            let data = std::fs::read(&source)
                .with_context(|| format!("Failed to read file: {}", source.display()))?;
            (data, util::is_executable(&source)?)
        } else {
            let mut entry = payloads
                .find_entry(&self.path)?
                .ok_or_else(|| PatchError::MissingEntry(self.path.clone()))?;
            let executable = read_executable_flag(&mut entry)?;
            let delta = binary_patch::read_delta(&mut entry)?;
            // Scope the mapping so it is dropped before the file is replaced.
            let data = {
                let old_data = util::read_file_bytes(&source)?;
                binary_patch::apply_delta(&old_data, &delta)
                    .with_context(|| format!("Failed to patch {}", self.path))?
            };
            (data, executable)
        };

        util::delete(&target)?;
        util::write_file(&target, &updated)?;
        util::set_executable(&target, executable)
    }

    pub fn revert(&self, to_dir: &Path, backup_dir: &Path) -> Result<()> {
        let target = util::resolve(to_dir, &self.path);
        let backup = util::resolve(backup_dir, &self.path);
        if exists(&backup) {
            restore(&backup, &target)
        } else {
            util::delete(&target)
        }
    }
}
