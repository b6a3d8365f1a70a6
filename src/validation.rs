use std::fmt;

pub const ABSENT_MESSAGE: &str = "Absent";
pub const MODIFIED_MESSAGE: &str = "Modified";
pub const ALREADY_EXISTS_MESSAGE: &str = "Already exists";
pub const ACCESS_DENIED_MESSAGE: &str = "Access denied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Error,
    Conflict,
}

/// What the failing action was about to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
    Move,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Create => "Create",
            Action::Update => "Update",
            Action::Delete => "Delete",
            Action::Move => "Move",
        };
        f.write_str(name)
    }
}

/// A way to resolve a conflict. New choices may be added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResolutionOption {
    /// Leave the installed file alone.
    Skip,
    /// Overwrite whatever is installed.
    Replace,
    /// Delete the installed file even though it was modified.
    Delete,
}

impl ResolutionOption {
    /// Whether the action should still run under this choice.
    pub fn proceeds(self) -> bool {
        !matches!(self, ResolutionOption::Skip)
    }
}

impl fmt::Display for ResolutionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionOption::Skip => "Skip",
            ResolutionOption::Replace => "Replace",
            ResolutionOption::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// A single action that failed validation, with the choices offered to the user.
/// An empty `options` list means the conflict cannot be resolved and blocks
/// the whole patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub kind: Kind,
    pub path: String,
    pub action: Action,
    pub message: String,
    pub options: Vec<ResolutionOption>,
}

impl ValidationResult {
    pub fn new(
        kind: Kind,
        path: impl Into<String>,
        action: Action,
        message: impl Into<String>,
        options: Vec<ResolutionOption>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            action,
            message: message.into(),
            options,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.options.is_empty()
    }

    /// The choice used when the user does not pick one.
    pub fn default_option(&self) -> Option<ResolutionOption> {
        self.options.first().copied()
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action, self.path, self.message)
    }
}
