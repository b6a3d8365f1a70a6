use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;

use super::{exists, read_executable_flag, restore, validate_access, Policy};
use crate::digester::{self, Checksum};
use crate::error::PatchError;
use crate::multi_zip::{PayloadReader, PayloadWriter};
use crate::patch_format::ZSTD_LEVEL;
use crate::util;
use crate::validation::{self, Action, ResolutionOption, ValidationResult};

/// Add a file or directory that is new in this version.
///
/// `checksum` is the checksum of the content being created; it lets
/// validation accept an installation that already has the right file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAction {
    pub path: String,
    pub checksum: Checksum,
}

impl CreateAction {
    pub fn new(path: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            path: path.into(),
            checksum,
        }
    }

    fn is_dir(&self) -> bool {
        util::is_dir_path(&self.path)
    }

    /// Payload: executable flag byte, then the file as a zstd frame.
    pub fn build_payload<W: Write + Seek>(
        &self,
        new_dir: &Path,
        out: &mut PayloadWriter<'_, W>,
    ) -> Result<()> {
        if self.is_dir() {
            return Ok(());
        }
        let source = util::resolve(new_dir, &self.path);
        let file = fs::File::open(&source)
            .with_context(|| format!("Failed to open file: {}", source.display()))?;

        out.put_next_entry(&self.path)?;
        out.write_all(&[util::is_executable(&source)? as u8])
            .context("Failed to write executable flag")?;
        zstd::stream::copy_encode(BufReader::with_capacity(256 * 1024, file), &mut *out, ZSTD_LEVEL)
            .with_context(|| format!("Failed to pack file: {}", source.display()))?;
        Ok(())
    }

    pub fn validate(&self, to_dir: &Path, policy: &Policy) -> Option<ValidationResult> {
        let target = util::resolve(to_dir, &self.path);
        if !exists(&target) {
            return None;
        }
        if self.is_dir() {
            if target.is_dir() {
                return None;
            }
        } else {
            if let Some(result) = validate_access(policy, &self.path, &target, Action::Create) {
                return Some(result);
            }
            let already_there = !policy.strict
                && target.is_file()
                && digester::digest_file(&target, policy.zip_as_binary)
                    .map(|actual| actual == self.checksum)
                    .unwrap_or(false);
            if already_there {
                return None;
            }
        }
        Some(policy.conflict(
            &self.path,
            Action::Create,
            validation::ALREADY_EXISTS_MESSAGE,
            vec![ResolutionOption::Skip, ResolutionOption::Replace],
        ))
    }

    pub fn apply<R: Read + Seek>(&self, payloads: &mut PayloadReader<'_, R>, to_dir: &Path) -> Result<()> {
        let target = util::resolve(to_dir, &self.path);
        if self.is_dir() {
            if exists(&target) && !target.is_dir() {
                util::delete(&target)?;
            }
            return fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()));
        }

        let mut entry = payloads
            .find_entry(&self.path)?
            .ok_or_else(|| PatchError::MissingEntry(self.path.clone()))?;
        let executable = read_executable_flag(&mut entry)?;

        util::delete(&target)?;
        let mut decoder = zstd::Decoder::new(entry).context("Failed to create zstd decoder")?;
        util::copy_stream_to_file(&mut decoder, &target)
            .with_context(|| format!("Failed to unpack {}", self.path))?;
        util::set_executable(&target, executable)
    }

    pub fn revert(&self, to_dir: &Path, backup_dir: &Path) -> Result<()> {
        let target = util::resolve(to_dir, &self.path);
        util::delete(&target)?;
        let backup = util::resolve(backup_dir, &self.path);
        if exists(&backup) {
            restore(&backup, &target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests::{pack, Fixture};
    use crate::action::PatchAction;

    #[test]
    fn test_existing_file_with_same_content_is_accepted() {
        let fx = Fixture::new();
        fx.write_new("docs/readme.txt", b"v2");
        fx.write_target("docs/readme.txt", b"v2");

        let action = CreateAction::new("docs/readme.txt", digester::digest_bytes(b"v2"));
        assert!(action.validate(fx.target(), &Policy::default()).is_none());

        let strict = Policy {
            strict: true,
            ..Policy::default()
        };
        let result = action.validate(fx.target(), &strict).unwrap();
        assert!(result.is_blocking());
    }

    #[test]
    fn test_conflicting_file_offers_replace() {
        let fx = Fixture::new();
        fx.write_target("readme.txt", b"local edits");

        let action = CreateAction::new("readme.txt", digester::digest_bytes(b"v2"));
        let result = action.validate(fx.target(), &Policy::default()).unwrap();

        assert_eq!(result.message, validation::ALREADY_EXISTS_MESSAGE);
        assert_eq!(result.options, vec![ResolutionOption::Skip, ResolutionOption::Replace]);
    }

    #[test]
    fn test_apply_writes_content_and_revert_removes_it() {
        let fx = Fixture::new();
        fx.write_new("bin/tool", b"#!/bin/sh\necho hi\n");
        util::set_executable(&fx.new_dir().join("bin/tool"), true).unwrap();

        let action = PatchAction::Create(CreateAction::new("bin/tool", 0));
        let mut archive = pack(&fx, &[&action]);
        let mut payloads = archive.payloads();

        action.backup(fx.target(), fx.backup()).unwrap();
        action.apply(&mut payloads, fx.target(), fx.backup()).unwrap();
        assert_eq!(fx.read_target("bin/tool").unwrap(), b"#!/bin/sh\necho hi\n");
        #[cfg(unix)]
        assert!(util::is_executable(&fx.target().join("bin/tool")).unwrap());

        action.revert(fx.target(), fx.backup()).unwrap();
        assert!(fx.read_target("bin/tool").is_none());
    }

    #[test]
    fn test_replace_then_revert_restores_local_file() {
        let fx = Fixture::new();
        fx.write_new("readme.txt", b"new");
        fx.write_target("readme.txt", b"mine");

        let action = PatchAction::Create(CreateAction::new("readme.txt", digester::digest_bytes(b"new")));
        let mut archive = pack(&fx, &[&action]);
        let mut payloads = archive.payloads();

        action.backup(fx.target(), fx.backup()).unwrap();
        action.apply(&mut payloads, fx.target(), fx.backup()).unwrap();
        assert_eq!(fx.read_target("readme.txt").unwrap(), b"new");

        action.revert(fx.target(), fx.backup()).unwrap();
        assert_eq!(fx.read_target("readme.txt").unwrap(), b"mine");
    }

    #[test]
    fn test_directory_create() {
        let fx = Fixture::new();
        let action = PatchAction::Create(CreateAction::new("plugins/", digester::DIRECTORY));
        let mut archive = pack(&fx, &[&action]);
        let mut payloads = archive.payloads();

        assert!(action.clone().validate(fx.target(), &Policy::default()).is_none());
        action.apply(&mut payloads, fx.target(), fx.backup()).unwrap();
        assert!(fx.target().join("plugins").is_dir());

        action.revert(fx.target(), fx.backup()).unwrap();
        assert!(!fx.target().join("plugins").exists());
    }
}
