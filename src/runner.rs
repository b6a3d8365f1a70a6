//! Top-level flows behind the command line: packaging a distributable
//! artifact and installing one into a directory.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::apply;
use crate::create;
use crate::error::{is_cancelled, PatchError};
use crate::patch::{ApplySession, ApplySummary, Patch, PatchSpec};
use crate::patch_format::{BuildDescriptions, PATCH_FILE_ENTRY, PATCH_PROPERTIES_ENTRY};
use crate::ui::{Options, UpdaterUi};
use crate::util::{self, TempSession};
use crate::validation::ValidationResult;

/// Exit code of a successful install: the application must be restarted.
pub const RESULT_REQUIRES_RESTART: i32 = 42;

/// Collect the `;`-separated values of every `name=...` argument.
pub fn extract_files(args: &[String], name: &str) -> Vec<String> {
    let prefix = format!("{}=", name);
    args.iter()
        .filter_map(|arg| arg.strip_prefix(&prefix))
        .flat_map(|list| list.split(';'))
        .filter(|each| !each.is_empty())
        .map(String::from)
        .collect()
}

/// Create the patch and pack it into the artifact at `spec.patch_file`.
pub fn create(spec: &PatchSpec, ui: &mut dyn UpdaterUi) -> Result<Patch> {
    let mut temp = TempSession::new();
    let result = create_impl(spec, &mut temp, ui);
    let cleaned = cleanup(&mut temp, ui);
    let patch = result?;
    cleaned?;
    Ok(patch)
}

fn create_impl(spec: &PatchSpec, temp: &mut TempSession, ui: &mut dyn UpdaterUi) -> Result<Patch> {
    let inner = temp.create_temp_file()?;
    let patch = create::create(spec, &inner, ui)?;

    let out_file = &spec.patch_file;
    info!("Packing jar file '{}'...", out_file.display());
    ui.start_process(&format!("Packing jar file '{}'...", out_file.display()));
    ui.check_cancelled()?;

    let file = File::create(out_file)
        .with_context(|| format!("Failed to create output file: {}", out_file.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    if let Some(jar) = &spec.jar_file {
        let template = File::open(jar)
            .with_context(|| format!("Failed to open template: {}", jar.display()))?;
        let mut template = ZipArchive::new(BufReader::new(template))
            .with_context(|| format!("Template is not a zip file: {}", jar.display()))?;
        for i in 0..template.len() {
            let entry = template
                .by_index_raw(i)
                .with_context(|| format!("Failed to read template entry #{}", i))?;
            if entry.name() == PATCH_PROPERTIES_ENTRY || entry.name() == PATCH_FILE_ENTRY {
                continue;
            }
            zip.raw_copy_file(entry)
                .context("Failed to copy template entry")?;
        }
    }

    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(PATCH_PROPERTIES_ENTRY, deflated)
        .context("Failed to start archive entry")?;
    BuildDescriptions::new(&spec.old_build_description, &spec.new_build_description).write(&mut zip)?;

    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);
    zip.start_file(PATCH_FILE_ENTRY, stored)
        .context("Failed to start archive entry")?;
    let mut inner_file = BufReader::new(
        File::open(&inner).with_context(|| format!("Failed to open {}", inner.display()))?,
    );
    std::io::copy(&mut inner_file, &mut zip).context("Failed to pack patch file")?;

    zip.finish()
        .context("Failed to finish artifact")?
        .flush()
        .with_context(|| format!("Failed to write {}", out_file.display()))?;
    Ok(patch)
}

/// Install the artifact into `to_dir`.
///
/// Extracts the inner patch into a temp session, validates, lets the UI
/// resolve conflicts and applies. On failure or cancellation the actions
/// applied so far are reverted. The temp session is always cleaned up, and
/// failures are reported through [`UpdaterUi::show_error`] before being
/// returned.
pub fn install(artifact: &Path, to_dir: &Path, ui: &mut dyn UpdaterUi) -> Result<ApplySummary> {
    let mut temp = TempSession::new();
    let result = install_impl(artifact, to_dir, &mut temp, ui);
    if let Err(e) = &result {
        if is_cancelled(e) {
            info!("Installation cancelled");
        } else {
            ui.show_error(e);
        }
    }
    if let Err(e) = cleanup(&mut temp, ui) {
        ui.show_error(&e);
    }
    result
}

fn install_impl(
    artifact: &Path,
    to_dir: &Path,
    temp: &mut TempSession,
    ui: &mut dyn UpdaterUi,
) -> Result<ApplySummary> {
    ui.start_process("Extracting patch file...");
    ui.set_progress_indeterminate();
    let patch_file = temp.create_temp_file()?;
    extract_patch_file(artifact, &patch_file)?;
    ui.check_cancelled()?;

    let preparation = apply::prepare_and_validate(&patch_file, to_dir, ui)?;
    let options = ui.ask_user(&preparation.validation_results)?;

    let mut session = ApplySession::new(temp.create_temp_dir()?);
    match apply::apply(&preparation, &options, &mut session, ui) {
        Ok(summary) => Ok(summary),
        Err(e) => {
            if !session.applied.is_empty() {
                warn!("Reverting {} applied actions", session.applied.len());
                let reverted = apply::revert(
                    &preparation,
                    &session.applied,
                    &session.backup_dir,
                    &mut Uncancellable(&mut *ui),
                );
                if let Err(revert_error) = reverted {
                    ui.show_error(&revert_error);
                }
            }
            Err(e)
        }
    }
}

/// Copy the inner patch archive out of the artifact.
fn extract_patch_file(artifact: &Path, to: &Path) -> Result<()> {
    let file = File::open(artifact)
        .with_context(|| format!("Failed to open artifact: {}", artifact.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Artifact is not a zip file: {}", artifact.display()))?;
    let mut entry = match archive.by_name(PATCH_FILE_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(PatchError::MissingEntry(PATCH_FILE_ENTRY.to_string()).into())
        }
        Err(e) => return Err(e).context("Failed to read artifact"),
    };
    util::copy_stream_to_file(&mut entry, to)?;
    Ok(())
}

fn cleanup(temp: &mut TempSession, ui: &mut dyn UpdaterUi) -> Result<()> {
    ui.start_process("Cleaning up...");
    ui.set_progress_indeterminate();
    temp.cleanup()
}

/// Forwards to the wrapped UI but never reports cancellation, so that a
/// revert started because of a cancel runs to completion.
struct Uncancellable<'a>(&'a mut dyn UpdaterUi);

impl UpdaterUi for Uncancellable<'_> {
    fn start_process(&mut self, title: &str) {
        self.0.start_process(title);
    }

    fn set_progress(&mut self, percentage: u32) {
        self.0.set_progress(percentage);
    }

    fn set_progress_indeterminate(&mut self) {
        self.0.set_progress_indeterminate();
    }

    fn set_status(&mut self, status: &str) {
        self.0.set_status(status);
    }

    fn set_description(&mut self, old_build: &str, new_build: &str) {
        self.0.set_description(old_build, new_build);
    }

    fn check_cancelled(&mut self) -> Result<()> {
        Ok(())
    }

    fn ask_user(&mut self, conflicts: &[ValidationResult]) -> Result<Options> {
        self.0.ask_user(conflicts)
    }

    fn show_error(&mut self, error: &anyhow::Error) {
        self.0.show_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationCancelled;
    use crate::ui::ConsoleUi;
    use std::fs;
    use std::io::Read;
    use std::path::PathBuf;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_files() {
        let args = args(&[
            "create",
            "ignored=a.txt;b/c.txt",
            "critical=lib/boot.jar",
            "ignored=;d",
            "optional=",
        ]);
        assert_eq!(extract_files(&args, "ignored"), vec!["a.txt", "b/c.txt", "d"]);
        assert_eq!(extract_files(&args, "critical"), vec!["lib/boot.jar"]);
        assert!(extract_files(&args, "optional").is_empty());
        assert!(extract_files(&args, "delete").is_empty());
    }

    /// Cancels on the `n`th cancellation check once apply has started.
    struct CancelDuringApply {
        console: ConsoleUi,
        applying: bool,
        checks_left: usize,
        errors: usize,
    }

    impl UpdaterUi for CancelDuringApply {
        fn start_process(&mut self, title: &str) {
            self.applying = title.starts_with("Applying");
            self.console.start_process(title);
        }

        fn set_status(&mut self, status: &str) {
            self.console.set_status(status);
        }

        fn check_cancelled(&mut self) -> Result<()> {
            if self.applying {
                if self.checks_left == 0 {
                    return Err(OperationCancelled.into());
                }
                self.checks_left -= 1;
            }
            Ok(())
        }

        fn ask_user(&mut self, conflicts: &[ValidationResult]) -> Result<Options> {
            self.console.ask_user(conflicts)
        }

        fn show_error(&mut self, error: &anyhow::Error) {
            self.errors += 1;
            self.console.show_error(error);
        }
    }

    struct Trees {
        _dir: tempfile::TempDir,
        target: PathBuf,
        artifact: PathBuf,
    }

    fn make_artifact(template: Option<PathBuf>) -> Trees {
        let dir = tempfile::tempdir().unwrap();
        let (old, new, target) = (
            dir.path().join("old"),
            dir.path().join("new"),
            dir.path().join("target"),
        );
        util::write_file(&old.join("a.txt"), b"a1").unwrap();
        util::write_file(&old.join("lib/b.bin"), &[1u8; 9000]).unwrap();
        util::write_file(&new.join("c.txt"), b"c2").unwrap();
        util::write_file(&new.join("lib/b.bin"), &[2u8; 9000]).unwrap();
        util::copy(&old, &target).unwrap();

        let artifact = dir.path().join("update.zip");
        let spec = PatchSpec::new()
            .old_build_description("build 1")
            .new_build_description("build 2")
            .old_folder(&old)
            .new_folder(&new)
            .patch_file(&artifact)
            .jar_file(template);
        create(&spec, &mut ConsoleUi::default()).unwrap();
        Trees {
            _dir: dir,
            target,
            artifact,
        }
    }

    #[test]
    fn test_artifact_keeps_template_entries() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("bootstrap.zip");
        {
            let mut zip = ZipWriter::new(File::create(&template).unwrap());
            zip.start_file("launcher/Main.class", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"class bytes").unwrap();
            zip.start_file(PATCH_PROPERTIES_ENTRY, SimpleFileOptions::default()).unwrap();
            zip.write_all(b"stale=1\n").unwrap();
            zip.finish().unwrap();
        }

        let trees = make_artifact(Some(template));
        let mut archive = ZipArchive::new(File::open(&trees.artifact).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"launcher/Main.class".to_string()));
        assert!(names.contains(&PATCH_FILE_ENTRY.to_string()));

        let mut props = String::new();
        archive
            .by_name(PATCH_PROPERTIES_ENTRY)
            .unwrap()
            .read_to_string(&mut props)
            .unwrap();
        assert!(props.contains("old.build.description=build 1"));
        assert!(!props.contains("stale"));
    }

    #[test]
    fn test_install_applies_patch() {
        let trees = make_artifact(None);
        let summary = install(&trees.artifact, &trees.target, &mut ConsoleUi::default()).unwrap();

        assert_eq!((summary.created, summary.updated, summary.deleted), (1, 1, 1));
        assert!(!trees.target.join("a.txt").exists());
        assert_eq!(fs::read(trees.target.join("c.txt")).unwrap(), b"c2");
        assert_eq!(fs::read(trees.target.join("lib/b.bin")).unwrap(), vec![2u8; 9000]);
    }

    #[test]
    fn test_cancelled_install_is_reverted() {
        let trees = make_artifact(None);
        let mut ui = CancelDuringApply {
            console: ConsoleUi::default(),
            applying: false,
            checks_left: 2,
            errors: 0,
        };

        let err = install(&trees.artifact, &trees.target, &mut ui).unwrap_err();
        assert!(is_cancelled(&err));
        assert_eq!(ui.errors, 0);
        assert_eq!(fs::read(trees.target.join("a.txt")).unwrap(), b"a1");
        assert_eq!(fs::read(trees.target.join("lib/b.bin")).unwrap(), vec![1u8; 9000]);
        assert!(!trees.target.join("c.txt").exists());
    }

    #[test]
    fn test_artifact_without_patch_entry() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("empty.zip");
        ZipWriter::new(File::create(&artifact).unwrap()).finish().unwrap();

        let err = install(&artifact, dir.path(), &mut ConsoleUi::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::MissingEntry(_))
        ));
    }
}
