use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::PatchError;
use crate::multi_zip::MultiZipFile;
use crate::patch::{ApplySession, ApplySummary, Patch};
use crate::patch_format::{BuildDescriptions, PATCH_INFO_ENTRY, PATCH_PROPERTIES_ENTRY};
use crate::ui::{Options, UpdaterUi};
use crate::validation::ValidationResult;

/// A patch read from its archive and checked against an installation.
#[derive(Debug)]
pub struct PreparationResult {
    pub patch: Patch,
    pub patch_file: PathBuf,
    pub to_dir: PathBuf,
    pub validation_results: Vec<ValidationResult>,
}

impl PreparationResult {
    pub fn blocking_conflicts(&self) -> Vec<String> {
        self.validation_results
            .iter()
            .filter(|r| r.is_blocking())
            .map(|r| r.path.clone())
            .collect()
    }
}

/// Read the index of `patch_file` and validate it against `to_dir`.
/// The installation is not modified.
pub fn prepare_and_validate(
    patch_file: &Path,
    to_dir: &Path,
    ui: &mut dyn UpdaterUi,
) -> Result<PreparationResult> {
    let mut patch = {
        let mut archive = MultiZipFile::open(patch_file)?;
        let properties = archive.read_metadata(PATCH_PROPERTIES_ENTRY)?;
        let descriptions = BuildDescriptions::read(properties.as_slice())?;
        ui.set_description(&descriptions.old, &descriptions.new);

        let index = archive.read_metadata(PATCH_INFO_ENTRY)?;
        Patch::read(&mut index.as_slice())?
    };

    let validation_results = patch.validate(to_dir, ui)?;
    info!(
        "{} actions, {} conflicts",
        patch.actions().len(),
        validation_results.len()
    );

    Ok(PreparationResult {
        patch,
        patch_file: patch_file.to_path_buf(),
        to_dir: to_dir.to_path_buf(),
        validation_results,
    })
}

/// Apply a prepared patch.
///
/// Refuses to start while any blocking conflict remains. Conflicts without
/// an entry in `options` get their default resolution. On error the
/// installation is left partly patched; `session.applied` lists what to
/// pass to [`revert`].
pub fn apply(
    preparation: &PreparationResult,
    options: &Options,
    session: &mut ApplySession,
    ui: &mut dyn UpdaterUi,
) -> Result<ApplySummary> {
    let blocking = preparation.blocking_conflicts();
    if !blocking.is_empty() {
        return Err(PatchError::BlockingConflicts(blocking).into());
    }

    let mut options = options.clone();
    for conflict in &preparation.validation_results {
        if !options.contains_key(&conflict.path) {
            if let Some(choice) = conflict.default_option() {
                warn!("{} unresolved, using {}", conflict.path, choice);
                options.insert(conflict.path.clone(), choice);
            }
        }
    }

    let mut archive = MultiZipFile::open(&preparation.patch_file)?;
    preparation
        .patch
        .apply(&mut archive, &preparation.to_dir, session, &options, ui)
}

/// Undo the actions recorded in `applied` using the backups in `backup_dir`.
pub fn revert(
    preparation: &PreparationResult,
    applied: &[usize],
    backup_dir: &Path,
    ui: &mut dyn UpdaterUi,
) -> Result<()> {
    info!("Reverting {} actions", applied.len());
    preparation
        .patch
        .revert(applied, backup_dir, &preparation.to_dir, ui)
}
