//! Per-path patch actions.
//!
//! An action is built while diffing two trees (and then serialized into the
//! patch index together with its payload), or read back from an index when a
//! patch is applied. On the apply side every action goes through
//! validate → backup → apply, and may later be reverted from its backup.

mod create;
mod delete;
mod multi;
mod update;

pub use create::CreateAction;
pub use delete::DeleteAction;
pub use multi::MultiAction;
pub use update::UpdateAction;

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::digester::{self, Checksum};
use crate::error::PatchError;
use crate::multi_zip::{PayloadReader, PayloadWriter};
use crate::ui::Options;
use crate::util;
use crate::validation::{self, Action, Kind, ResolutionOption, ValidationResult};

const TAG_CREATE: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_UPDATE: u8 = 3;
const TAG_MULTI: u8 = 4;

/// How conflicts are judged. Supplied when the patch is created and stored
/// in its index.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub critical: Vec<String>,
    pub optional: Vec<String>,
    /// Full-match patterns of paths deleted without checking their content.
    pub delete_patterns: Vec<Regex>,
    pub strict: bool,
    pub zip_as_binary: bool,
}

impl Policy {
    pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{})$", p))
                    .with_context(|| format!("Invalid delete pattern: {}", p))
            })
            .collect()
    }

    pub fn is_critical(&self, path: &str) -> bool {
        self.critical.iter().any(|p| p == path)
    }

    pub fn is_optional(&self, path: &str) -> bool {
        self.optional.iter().any(|p| p == path)
    }

    /// False for paths matching a delete pattern.
    pub fn validate_deletion(&self, path: &str) -> bool {
        !self.delete_patterns.iter().any(|p| p.is_match(path))
    }

    /// Build a result, dropping the offered options when the conflict must
    /// block the patch: always for critical paths, and in strict mode for
    /// everything that is not optional.
    fn result(
        &self,
        kind: Kind,
        path: &str,
        action: Action,
        message: &str,
        options: Vec<ResolutionOption>,
    ) -> ValidationResult {
        let blocking = self.is_critical(path) || (self.strict && !self.is_optional(path));
        let options = if blocking { Vec::new() } else { options };
        ValidationResult::new(kind, path, action, message, options)
    }

    fn conflict(
        &self,
        path: &str,
        action: Action,
        message: &str,
        options: Vec<ResolutionOption>,
    ) -> ValidationResult {
        self.result(Kind::Conflict, path, action, message, options)
    }

    fn error(&self, path: &str, action: Action, message: &str) -> ValidationResult {
        self.result(Kind::Error, path, action, message, vec![ResolutionOption::Skip])
    }
}

#[derive(Debug, Clone)]
pub enum PatchAction {
    Create(CreateAction),
    Delete(DeleteAction),
    Update(UpdateAction),
    Multi(MultiAction),
}

impl PatchAction {
    pub fn path(&self) -> &str {
        match self {
            PatchAction::Create(a) => &a.path,
            PatchAction::Delete(a) => &a.path,
            PatchAction::Update(a) => &a.path,
            PatchAction::Multi(a) => &a.path,
        }
    }

    pub fn checksum(&self) -> Checksum {
        match self {
            PatchAction::Create(a) => a.checksum,
            PatchAction::Delete(a) => a.checksum,
            PatchAction::Update(a) => a.checksum,
            PatchAction::Multi(a) => a.checksum,
        }
    }

    /// Kind of change this action makes; for a multi-action, the kind of the
    /// selected variant (or of the first one before validation).
    pub fn kind(&self) -> Action {
        match self {
            PatchAction::Create(_) => Action::Create,
            PatchAction::Delete(_) => Action::Delete,
            PatchAction::Update(a) if a.is_move => Action::Move,
            PatchAction::Update(_) => Action::Update,
            PatchAction::Multi(a) => a.current().kind(),
        }
    }

    /// Append `other` as an alternative. Only multi-actions accept variants;
    /// escalating a plain action is the builder's job.
    pub fn merge(&mut self, other: PatchAction) {
        match self {
            PatchAction::Multi(multi) => multi.merge(other),
            _ => panic!("cannot merge into plain action for {}", self.path()),
        }
    }

    pub fn build_payload<W: Write + Seek>(
        &self,
        old_dir: &Path,
        new_dir: &Path,
        out: &mut PayloadWriter<'_, W>,
    ) -> Result<()> {
        match self {
            PatchAction::Create(a) => a.build_payload(new_dir, out),
            PatchAction::Delete(_) => Ok(()),
            PatchAction::Update(a) => a.build_payload(old_dir, new_dir, out),
            PatchAction::Multi(a) => a.build_payload(old_dir, new_dir, out),
        }
    }

    /// Check the installation. Never fails: problems are reported as a result.
    pub fn validate(&mut self, to_dir: &Path, policy: &Policy) -> Option<ValidationResult> {
        match self {
            PatchAction::Create(a) => a.validate(to_dir, policy),
            PatchAction::Delete(a) => a.validate(to_dir, policy),
            PatchAction::Update(a) => a.validate(to_dir, policy),
            PatchAction::Multi(a) => a.validate(to_dir, policy),
        }
    }

    /// Whether apply should touch this path given the user's choices.
    pub fn should_apply(&self, to_dir: &Path, options: &Options, policy: &Policy) -> bool {
        if let Some(option) = options.get(self.path()) {
            if !option.proceeds() {
                return false;
            }
        }
        if let PatchAction::Multi(a) = self {
            return !a.is_unresolved() && a.selected().should_apply(to_dir, options, policy);
        }
        if !policy.is_optional(self.path()) {
            return true;
        }
        // Optional files may be missing from the installation; leave them so.
        match self {
            PatchAction::Delete(a) => exists(&util::resolve(to_dir, &a.path)),
            PatchAction::Update(a) => exists(&util::resolve(to_dir, &a.source)),
            _ => true,
        }
    }

    pub fn backup(&self, to_dir: &Path, backup_dir: &Path) -> Result<()> {
        match self {
            PatchAction::Multi(a) => a.selected().backup(to_dir, backup_dir),
            _ => {
                let target = util::resolve(to_dir, self.path());
                if exists(&target) {
                    util::copy(&target, &util::resolve(backup_dir, self.path()))?;
                }
                Ok(())
            }
        }
    }

    pub fn apply<R: Read + Seek>(
        &self,
        payloads: &mut PayloadReader<'_, R>,
        to_dir: &Path,
        backup_dir: &Path,
    ) -> Result<()> {
        match self {
            PatchAction::Create(a) => a.apply(payloads, to_dir),
            PatchAction::Delete(a) => a.apply(to_dir),
            PatchAction::Update(a) => a.apply(payloads, to_dir, backup_dir),
            PatchAction::Multi(a) => a.apply(payloads, to_dir, backup_dir),
        }
    }

    pub fn revert(&self, to_dir: &Path, backup_dir: &Path) -> Result<()> {
        match self {
            PatchAction::Create(a) => a.revert(to_dir, backup_dir),
            PatchAction::Delete(a) => a.revert(to_dir, backup_dir),
            PatchAction::Update(a) => a.revert(to_dir, backup_dir),
            PatchAction::Multi(a) => a.selected().revert(to_dir, backup_dir),
        }
    }

    /// True when reverting puts content back (and so must run parents first);
    /// false when it removes what apply created (children first).
    pub fn reverts_by_restoring(&self, backup_dir: &Path) -> bool {
        match self {
            PatchAction::Create(_) => false,
            PatchAction::Delete(_) => true,
            PatchAction::Update(a) => exists(&util::resolve(backup_dir, &a.path)),
            PatchAction::Multi(a) => a.selected().reverts_by_restoring(backup_dir),
        }
    }

    /// Write the index record: tag byte, then the action's fields.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let tag = match self {
            PatchAction::Create(_) => TAG_CREATE,
            PatchAction::Delete(_) => TAG_DELETE,
            PatchAction::Update(_) => TAG_UPDATE,
            PatchAction::Multi(_) => TAG_MULTI,
        };
        out.write_all(&[tag]).context("Failed to write action record")?;
        match self {
            PatchAction::Create(a) => bincode::serialize_into(&mut *out, a),
            PatchAction::Delete(a) => bincode::serialize_into(&mut *out, a),
            PatchAction::Update(a) => bincode::serialize_into(&mut *out, a),
            PatchAction::Multi(a) => return a.write(out),
        }
        .with_context(|| format!("Failed to write action record for {}", self.path()))
    }

    pub fn read<R: Read>(input: &mut R) -> Result<PatchAction> {
        let mut tag = [0u8; 1];
        input
            .read_exact(&mut tag)
            .context("Failed to read action record")?;
        let action = match tag[0] {
            TAG_CREATE => PatchAction::Create(
                bincode::deserialize_from(&mut *input).context("Failed to read create action")?,
            ),
            TAG_DELETE => PatchAction::Delete(
                bincode::deserialize_from(&mut *input).context("Failed to read delete action")?,
            ),
            TAG_UPDATE => PatchAction::Update(
                bincode::deserialize_from(&mut *input).context("Failed to read update action")?,
            ),
            TAG_MULTI => PatchAction::Multi(MultiAction::read(input)?),
            other => {
                return Err(PatchError::CorruptPatch(format!("unknown action tag {}", other)).into())
            }
        };
        Ok(action)
    }
}

pub fn write_actions<W: Write>(out: &mut W, actions: &[PatchAction]) -> Result<()> {
    bincode::serialize_into(&mut *out, &(actions.len() as u32))
        .context("Failed to write action count")?;
    for action in actions {
        action.write(out)?;
    }
    Ok(())
}

pub fn read_actions<R: Read>(input: &mut R) -> Result<Vec<PatchAction>> {
    let count: u32 = bincode::deserialize_from(&mut *input).context("Failed to read action count")?;
    (0..count).map(|_| PatchAction::read(input)).collect()
}

pub(crate) fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Report a target that exists but cannot be written.
fn validate_access(
    policy: &Policy,
    path: &str,
    target: &Path,
    action: Action,
) -> Option<ValidationResult> {
    let meta = fs::symlink_metadata(target).ok()?;
    if meta.is_file() && meta.permissions().readonly() {
        return Some(policy.error(path, action, validation::ACCESS_DENIED_MESSAGE));
    }
    None
}

/// Check that `file` still holds the content recorded when the patch was made.
fn validate_not_changed(
    policy: &Policy,
    path: &str,
    file: &Path,
    checksum: Checksum,
    action: Action,
    options: Vec<ResolutionOption>,
) -> Option<ValidationResult> {
    if !exists(file) {
        if policy.is_optional(path) {
            return None;
        }
        return Some(policy.conflict(
            path,
            action,
            validation::ABSENT_MESSAGE,
            vec![ResolutionOption::Skip],
        ));
    }
    match digester::digest_file(file, policy.zip_as_binary) {
        Ok(actual) if actual == checksum => None,
        Ok(_) => Some(policy.conflict(path, action, validation::MODIFIED_MESSAGE, options)),
        Err(e) => {
            tracing::warn!("{}: {:#}", file.display(), e);
            Some(policy.error(path, action, validation::ACCESS_DENIED_MESSAGE))
        }
    }
}

/// Put a backup back in place of whatever is at `target` now.
fn restore(backup: &Path, target: &Path) -> Result<()> {
    if !backup.is_dir() {
        util::delete(target)?;
    }
    util::copy(backup, target)
}

/// Read the executable flag that prefixes create and update payloads.
fn read_executable_flag<R: Read>(input: &mut R) -> Result<bool> {
    let mut flag = [0u8; 1];
    input
        .read_exact(&mut flag)
        .context("Failed to read executable flag")?;
    Ok(flag[0] != 0)
}
