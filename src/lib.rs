//! Directory-tree patch engine.
//!
//! [`create::create`] diffs an old and a new installation tree and writes a
//! patch archive; [`apply::prepare_and_validate`], [`apply::apply`] and
//! [`apply::revert`] check that archive against a live installation, apply it
//! with per-path backups, and undo it. [`runner`] wraps both sides in the
//! distributable artifact and install flow used by the binary.

pub mod action;
pub mod apply;
pub mod binary_diff;
pub mod binary_patch;
pub mod create;
pub mod diff_calculator;
pub mod digester;
pub mod error;
pub mod multi_zip;
pub mod patch;
pub mod patch_format;
mod rolling_hash;
pub mod runner;
pub mod ui;
pub mod util;
pub mod validation;

pub use apply::PreparationResult;
pub use error::{OperationCancelled, PatchError};
pub use patch::{ApplySession, ApplySummary, Patch, PatchSpec};
pub use ui::{CancelFlag, ConsoleUi, Options, UpdaterUi};
pub use validation::{ResolutionOption, ValidationResult};
