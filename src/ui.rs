use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::OperationCancelled;
use crate::validation::{ResolutionOption, ValidationResult};

/// User choices keyed by action path.
pub type Options = HashMap<String, ResolutionOption>;

/// Hooks the engine calls while it works. Front-ends render progress and
/// resolve conflicts; the engine never talks to the user directly.
pub trait UpdaterUi {
    fn start_process(&mut self, title: &str);

    fn set_progress(&mut self, _percentage: u32) {}

    fn set_progress_indeterminate(&mut self) {}

    fn set_status(&mut self, status: &str);

    fn set_description(&mut self, _old_build: &str, _new_build: &str) {}

    /// Returns `OperationCancelled` once the user has asked to stop.
    fn check_cancelled(&mut self) -> Result<()>;

    fn ask_user(&mut self, conflicts: &[ValidationResult]) -> Result<Options>;

    fn show_error(&mut self, error: &anyhow::Error);
}

/// Shared flag set from outside (a signal handler) to request cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Non-interactive console front-end: reports through `tracing`, resolves
/// every conflict with its default option.
#[derive(Debug, Default)]
pub struct ConsoleUi {
    cancel: CancelFlag,
}

impl ConsoleUi {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

impl UpdaterUi for ConsoleUi {
    fn start_process(&mut self, title: &str) {
        info!("{}", title);
    }

    fn set_status(&mut self, status: &str) {
        tracing::debug!("{}", status);
    }

    fn set_description(&mut self, old_build: &str, new_build: &str) {
        info!("Updating {} to {}", old_build, new_build);
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OperationCancelled.into());
        }
        Ok(())
    }

    fn ask_user(&mut self, conflicts: &[ValidationResult]) -> Result<Options> {
        let mut options = Options::new();
        for conflict in conflicts {
            match conflict.default_option() {
                Some(choice) => {
                    warn!("{} -> {}", conflict, choice);
                    options.insert(conflict.path.clone(), choice);
                }
                None => warn!("{} (cannot be resolved)", conflict),
            }
        }
        Ok(options)
    }

    fn show_error(&mut self, err: &anyhow::Error) {
        error!("{:#}", err);
    }
}
