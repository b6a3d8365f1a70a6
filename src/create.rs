use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::multi_zip::MultiZipWriter;
use crate::patch::{self, Patch, PatchSpec};
use crate::patch_format::{BuildDescriptions, PATCH_INFO_ENTRY, PATCH_PROPERTIES_ENTRY};
use crate::ui::UpdaterUi;

/// Diff the two trees of `spec` and write the patch archive to `patch_file`.
///
/// The index and the build descriptions go first, then one payload entry
/// per action. Returns the patch so callers can report on it.
pub fn create(spec: &PatchSpec, patch_file: &Path, ui: &mut dyn UpdaterUi) -> Result<Patch> {
    let patch = Patch::build(spec, ui)?;

    info!("Creating the patch file '{}'...", patch_file.display());
    ui.start_process(&format!("Creating the patch file '{}'...", patch_file.display()));
    ui.check_cancelled()?;

    let file = File::create(patch_file)
        .with_context(|| format!("Failed to create patch file: {}", patch_file.display()))?;
    let mut out = MultiZipWriter::new(BufWriter::new(file));

    out.start_metadata(PATCH_INFO_ENTRY)?;
    patch.write(&mut out)?;

    out.start_metadata(PATCH_PROPERTIES_ENTRY)?;
    BuildDescriptions::new(&spec.old_build_description, &spec.new_build_description).write(&mut out)?;

    let total = patch.actions().len();
    let mut payloads = out.payloads();
    for (i, action) in patch.actions().iter().enumerate() {
        info!("Packing {}", action.path());
        ui.set_status(&format!("Packing {}", action.path()));
        ui.set_progress(patch::percent(i, total));
        ui.check_cancelled()?;
        action
            .build_payload(&spec.old_folder, &spec.new_folder, &mut payloads)
            .with_context(|| format!("Failed to pack {}", action.path()))?;
    }

    out.finish()?
        .flush()
        .with_context(|| format!("Failed to write patch file: {}", patch_file.display()))?;
    Ok(patch)
}
