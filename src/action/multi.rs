use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, Write};
use std::path::Path;

use super::{read_actions, write_actions, PatchAction, Policy};
use crate::digester::Checksum;
use crate::multi_zip::{PayloadReader, PayloadWriter};
use crate::validation::ValidationResult;

/// Several candidate actions for one path.
///
/// The choice is made at validation time: the first variant, in insertion
/// order, that validates cleanly is selected and used for backup, apply and
/// revert. Each variant keeps its payload in its own archive namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAction {
    pub path: String,
    pub checksum: Checksum,
    #[serde(skip)]
    variants: Vec<PatchAction>,
    #[serde(skip)]
    selected: Option<usize>,
    #[serde(skip)]
    validated: bool,
}

impl MultiAction {
    pub(crate) fn new(path: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            path: path.into(),
            checksum,
            variants: Vec::new(),
            selected: None,
            validated: false,
        }
    }

    pub fn variants(&self) -> &[PatchAction] {
        &self.variants
    }

    pub fn merge(&mut self, other: PatchAction) {
        self.variants.push(other);
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    /// True once validation ran and found no clean variant; such an action
    /// can only be skipped.
    pub fn is_unresolved(&self) -> bool {
        self.validated && self.selected.is_none()
    }

    /// The variant chosen by validation.
    ///
    /// # Panics
    /// If validation has not selected a variant; backing up, applying or
    /// reverting an unvalidated multi-action is a bug in the caller.
    pub fn selected(&self) -> &PatchAction {
        &self.variants[self.selected_or_panic()]
    }

    fn selected_or_panic(&self) -> usize {
        match self.selected {
            Some(index) => index,
            None if self.validated => panic!("no variant selected for {}", self.path),
            None => panic!("no variant selected for {}: not validated", self.path),
        }
    }

    /// The selected variant, or the first one before validation.
    pub(crate) fn current(&self) -> &PatchAction {
        match self.selected {
            Some(index) => &self.variants[index],
            None => &self.variants[0],
        }
    }

    pub fn build_payload<W: Write + Seek>(
        &self,
        old_dir: &Path,
        new_dir: &Path,
        out: &mut PayloadWriter<'_, W>,
    ) -> Result<()> {
        for (i, variant) in self.variants.iter().enumerate() {
            variant.build_payload(old_dir, new_dir, &mut out.variant(i))?;
        }
        Ok(())
    }

    /// Select the first variant that validates. When none does, the last
    /// conflict is reported; with no variant to carry out it can only be
    /// skipped.
    pub fn validate(&mut self, to_dir: &Path, policy: &Policy) -> Option<ValidationResult> {
        self.selected = None;
        self.validated = true;
        let mut result = None;
        for (i, variant) in self.variants.iter_mut().enumerate() {
            result = variant.validate(to_dir, policy);
            if result.is_none() {
                self.selected = Some(i);
                break;
            }
        }
        result.map(|mut conflict| {
            conflict.options.retain(|option| !option.proceeds());
            conflict
        })
    }

    pub fn apply<R: Read + Seek>(
        &self,
        payloads: &mut PayloadReader<'_, R>,
        to_dir: &Path,
        backup_dir: &Path,
    ) -> Result<()> {
        let index = self.selected_or_panic();
        self.variants[index].apply(&mut payloads.variant(index), to_dir, backup_dir)
    }

    pub(super) fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        bincode::serialize_into(&mut *out, self)
            .with_context(|| format!("Failed to write action record for {}", self.path))?;
        write_actions(out, &self.variants)
    }

    pub(super) fn read<R: Read>(input: &mut R) -> Result<Self> {
        let mut multi: MultiAction =
            bincode::deserialize_from(&mut *input).context("Failed to read multi action")?;
        multi.variants = read_actions(input)?;
        Ok(multi)
    }
}
