//! The action list between two trees, and the phases run over it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::action::{self, CreateAction, DeleteAction, MultiAction, PatchAction, Policy, UpdateAction};
use crate::diff_calculator;
use crate::digester::{self, Checksum};
use crate::error::PatchError;
use crate::multi_zip::MultiZipFile;
use crate::patch_format::{FORMAT_VERSION, INDEX_MAGIC};
use crate::ui::{Options, UpdaterUi};
use crate::util;
use crate::validation::{Action, ValidationResult};

/// Everything needed to create a patch.
#[derive(Debug, Clone, Default)]
pub struct PatchSpec {
    pub old_build_description: String,
    pub new_build_description: String,
    pub old_folder: PathBuf,
    pub new_folder: PathBuf,
    pub patch_file: PathBuf,
    /// Bootstrap zip whose entries are copied into the artifact.
    pub jar_file: Option<PathBuf>,
    pub ignored_files: Vec<String>,
    pub critical_files: Vec<String>,
    pub optional_files: Vec<String>,
    pub delete_files: Vec<String>,
    pub zip_as_binary: bool,
    pub strict: bool,
}

impl PatchSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn old_build_description(mut self, description: impl Into<String>) -> Self {
        self.old_build_description = description.into();
        self
    }

    pub fn new_build_description(mut self, description: impl Into<String>) -> Self {
        self.new_build_description = description.into();
        self
    }

    pub fn old_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.old_folder = folder.into();
        self
    }

    pub fn new_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.new_folder = folder.into();
        self
    }

    pub fn patch_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.patch_file = file.into();
        self
    }

    pub fn jar_file(mut self, file: Option<PathBuf>) -> Self {
        self.jar_file = file;
        self
    }

    pub fn ignored_files(mut self, files: Vec<String>) -> Self {
        self.ignored_files = files;
        self
    }

    pub fn critical_files(mut self, files: Vec<String>) -> Self {
        self.critical_files = files;
        self
    }

    pub fn optional_files(mut self, files: Vec<String>) -> Self {
        self.optional_files = files;
        self
    }

    pub fn delete_files(mut self, patterns: Vec<String>) -> Self {
        self.delete_files = patterns;
        self
    }

    pub fn zip_as_binary(mut self, zip_as_binary: bool) -> Self {
        self.zip_as_binary = zip_as_binary;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Index header: the creation-time settings that validation depends on.
#[derive(Debug, Serialize, Deserialize)]
struct IndexHeader {
    ignored: Vec<String>,
    critical: Vec<String>,
    optional: Vec<String>,
    delete_patterns: Vec<String>,
    strict: bool,
    zip_as_binary: bool,
}

/// Where an apply keeps its backups, and which actions it has touched.
///
/// An action is recorded just before it mutates the installation, so a
/// failed action is reverted along with the ones that completed.
#[derive(Debug, Clone)]
pub struct ApplySession {
    pub backup_dir: PathBuf,
    pub applied: Vec<usize>,
}

impl ApplySession {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            applied: Vec::new(),
        }
    }
}

/// Summary of a completed apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub deleted: usize,
    pub skipped: usize,
}

impl ApplySummary {
    fn record(&mut self, kind: Action) {
        match kind {
            Action::Create => self.created += 1,
            Action::Update => self.updated += 1,
            Action::Move => self.moved += 1,
            Action::Delete => self.deleted += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Patch {
    actions: Vec<PatchAction>,
    ignored: Vec<String>,
    delete_patterns: Vec<String>,
    policy: Policy,
}

impl Patch {
    /// Digest both trees and derive the actions that turn one into the other.
    ///
    /// Deletes come first, deepest paths first; creates and updates follow in
    /// path order so parents exist before their children.
    pub fn build(spec: &PatchSpec, ui: &mut dyn UpdaterUi) -> Result<Self> {
        let policy = Policy {
            critical: spec.critical_files.clone(),
            optional: spec.optional_files.clone(),
            delete_patterns: Policy::compile_patterns(&spec.delete_files)?,
            strict: spec.strict,
            zip_as_binary: spec.zip_as_binary,
        };

        ui.start_process("Calculating difference...");
        ui.set_progress_indeterminate();
        ui.check_cancelled()?;
        let old_checksums =
            digester::digest_tree(&spec.old_folder, &spec.ignored_files, spec.zip_as_binary)?;
        ui.check_cancelled()?;
        let new_checksums =
            digester::digest_tree(&spec.new_folder, &spec.ignored_files, spec.zip_as_binary)?;
        ui.check_cancelled()?;

        let diff = diff_calculator::calculate(&old_checksums, &new_checksums);
        info!(
            "{} to delete, {} to create, {} to update, {} unchanged",
            diff.files_to_delete.len(),
            diff.files_to_create.len(),
            diff.files_to_update.len(),
            diff.common_files.len()
        );

        // A deleted file whose content shows up elsewhere can be moved there.
        let mut moved_from: HashMap<Checksum, &str> = HashMap::new();
        for (path, checksum) in &diff.files_to_delete {
            if !util::is_dir_path(path) {
                moved_from.entry(*checksum).or_insert(path.as_str());
            }
        }

        let mut actions = Vec::new();
        for (path, checksum) in diff.files_to_delete.iter().rev() {
            actions.push(PatchAction::Delete(DeleteAction::new(path.as_str(), *checksum)));
        }

        let mut changed: Vec<PatchAction> = Vec::new();
        for path in &diff.files_to_create {
            let checksum = new_checksums[path];
            let create = PatchAction::Create(CreateAction::new(path.as_str(), checksum));
            let action = match moved_from.get(&checksum) {
                Some(source) if !util::is_dir_path(path) => {
                    let mut multi = MultiAction::new(path.as_str(), checksum);
                    multi.merge(PatchAction::Update(UpdateAction::moved(path.as_str(), *source, checksum)));
                    multi.merge(create);
                    PatchAction::Multi(multi)
                }
                _ => create,
            };
            changed.push(action);
        }
        for (path, old_checksum) in &diff.files_to_update {
            // Archives digested by content may be repacked in the installation,
            // so a delta against the old tree's bytes would not apply.
            let by_content = !spec.zip_as_binary && digester::is_zip_file(path);
            let update = PatchAction::Update(
                UpdateAction::new(path.as_str(), *old_checksum).whole_file(by_content),
            );
            let new_checksum = new_checksums[path];
            let action = match moved_from.get(&new_checksum) {
                Some(source) => {
                    let mut multi = MultiAction::new(path.as_str(), *old_checksum);
                    multi.merge(update);
                    multi.merge(PatchAction::Update(UpdateAction::moved(path.as_str(), *source, new_checksum)));
                    PatchAction::Multi(multi)
                }
                None => update,
            };
            changed.push(action);
        }
        changed.sort_by(|a, b| a.path().cmp(b.path()));
        actions.extend(changed);

        Ok(Self {
            actions,
            ignored: spec.ignored_files.clone(),
            delete_patterns: spec.delete_files.clone(),
            policy,
        })
    }

    pub fn actions(&self) -> &[PatchAction] {
        &self.actions
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Index layout: magic, format version, bincode header, action records.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(INDEX_MAGIC).context("Failed to write patch index")?;
        bincode::serialize_into(&mut *out, &FORMAT_VERSION).context("Failed to write patch index")?;
        let header = IndexHeader {
            ignored: self.ignored.clone(),
            critical: self.policy.critical.clone(),
            optional: self.policy.optional.clone(),
            delete_patterns: self.delete_patterns.clone(),
            strict: self.policy.strict,
            zip_as_binary: self.policy.zip_as_binary,
        };
        bincode::serialize_into(&mut *out, &header).context("Failed to write patch index header")?;
        action::write_actions(out, &self.actions)
    }

    pub fn read<R: Read>(input: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .context("Failed to read patch index")?;
        if &magic != INDEX_MAGIC {
            return Err(PatchError::CorruptPatch("missing index header".to_string()).into());
        }
        let version: u32 = bincode::deserialize_from(&mut *input).context("Failed to read patch index")?;
        if version != FORMAT_VERSION {
            return Err(PatchError::UnsupportedFormat {
                found: version,
                expected: FORMAT_VERSION,
            }
            .into());
        }
        let header: IndexHeader =
            bincode::deserialize_from(&mut *input).context("Failed to read patch index header")?;
        let actions = action::read_actions(input)?;

        Ok(Self {
            actions,
            policy: Policy {
                critical: header.critical,
                optional: header.optional,
                delete_patterns: Policy::compile_patterns(&header.delete_patterns)?,
                strict: header.strict,
                zip_as_binary: header.zip_as_binary,
            },
            ignored: header.ignored,
            delete_patterns: header.delete_patterns,
        })
    }

    /// Check every action against the installation. Only reads `to_dir`.
    pub fn validate(&mut self, to_dir: &Path, ui: &mut dyn UpdaterUi) -> Result<Vec<ValidationResult>> {
        ui.start_process("Validating installation...");
        let total = self.actions.len();
        let mut results = Vec::new();
        for (i, action) in self.actions.iter_mut().enumerate() {
            ui.check_cancelled()?;
            ui.set_progress(percent(i, total));
            ui.set_status(action.path());
            if let Some(result) = action.validate(to_dir, &self.policy) {
                debug!("{}", result);
                results.push(result);
            }
        }
        ui.set_progress(100);
        Ok(results)
    }

    /// Apply every action the options allow, in order. Stops at the first
    /// failure or cancellation; `session.applied` then says what to revert.
    pub fn apply<R: Read + Seek>(
        &self,
        archive: &mut MultiZipFile<R>,
        to_dir: &Path,
        session: &mut ApplySession,
        options: &Options,
        ui: &mut dyn UpdaterUi,
    ) -> Result<ApplySummary> {
        ui.start_process("Applying patch...");
        let total = self.actions.len();
        let mut payloads = archive.payloads();
        let mut summary = ApplySummary::default();

        for (i, action) in self.actions.iter().enumerate() {
            ui.check_cancelled()?;
            ui.set_progress(percent(i, total));
            if !action.should_apply(to_dir, options, &self.policy) {
                debug!("Skipping {}", action.path());
                summary.skipped += 1;
                continue;
            }
            ui.set_status(action.path());
            debug!("{} {}", action.kind(), action.path());

            action
                .backup(to_dir, &session.backup_dir)
                .with_context(|| format!("Failed to back up {}", action.path()))?;
            session.applied.push(i);
            action
                .apply(&mut payloads, to_dir, &session.backup_dir)
                .with_context(|| format!("Failed to apply {} {}", action.kind(), action.path()))?;
            summary.record(action.kind());
        }
        ui.set_progress(100);
        Ok(summary)
    }

    /// Undo the given actions from their backups. Removals run first, deepest
    /// paths first; restorations follow, parents first.
    pub fn revert(
        &self,
        applied: &[usize],
        backup_dir: &Path,
        to_dir: &Path,
        ui: &mut dyn UpdaterUi,
    ) -> Result<()> {
        ui.start_process("Reverting...");
        let (mut restores, mut removals): (Vec<&PatchAction>, Vec<&PatchAction>) = applied
            .iter()
            .filter_map(|&i| self.actions.get(i))
            .partition(|a| a.reverts_by_restoring(backup_dir));
        removals.sort_by(|a, b| b.path().cmp(a.path()));
        restores.sort_by(|a, b| a.path().cmp(b.path()));

        let total = removals.len() + restores.len();
        for (i, action) in removals.into_iter().chain(restores).enumerate() {
            ui.check_cancelled()?;
            ui.set_progress(percent(i, total));
            ui.set_status(action.path());
            debug!("Reverting {}", action.path());
            action
                .revert(to_dir, backup_dir)
                .with_context(|| format!("Failed to revert {}", action.path()))?;
        }
        ui.set_progress(100);
        Ok(())
    }
}

pub(crate) fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        100
    } else {
        (done * 100 / total) as u32
    }
}
