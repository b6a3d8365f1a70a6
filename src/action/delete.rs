use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{exists, restore, validate_access, validate_not_changed, Policy};
use crate::digester::Checksum;
use crate::util;
use crate::validation::{self, Action, ResolutionOption, ValidationResult};

/// Remove a file or directory that no longer exists in the new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAction {
    pub path: String,
    pub checksum: Checksum,
}

impl DeleteAction {
    pub fn new(path: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            path: path.into(),
            checksum,
        }
    }

    pub fn validate(&self, to_dir: &Path, policy: &Policy) -> Option<ValidationResult> {
        let target = util::resolve(to_dir, &self.path);

        if util::is_dir_path(&self.path) {
            if target.is_dir() || (!exists(&target) && policy.is_optional(&self.path)) {
                return None;
            }
            let message = if exists(&target) {
                validation::MODIFIED_MESSAGE
            } else {
                validation::ABSENT_MESSAGE
            };
            return Some(policy.conflict(&self.path, Action::Delete, message, vec![ResolutionOption::Skip]));
        }

        if let Some(result) = validate_access(policy, &self.path, &target, Action::Delete) {
            return Some(result);
        }
        if !policy.validate_deletion(&self.path) {
            return None;
        }
        validate_not_changed(
            policy,
            &self.path,
            &target,
            self.checksum,
            Action::Delete,
            vec![ResolutionOption::Skip, ResolutionOption::Delete],
        )
    }

    pub fn apply(&self, to_dir: &Path) -> Result<()> {
        util::delete(&util::resolve(to_dir, &self.path))
    }

    pub fn revert(&self, to_dir: &Path, backup_dir: &Path) -> Result<()> {
        let backup = util::resolve(backup_dir, &self.path);
        if exists(&backup) {
            restore(&backup, &util::resolve(to_dir, &self.path))?;
        }
        Ok(())
    }
}
