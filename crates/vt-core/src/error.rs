use std::path::PathBuf;

/// Errors surfaced while activating, building or tearing down environments.
#[derive(Debug, thiserror::Error)]
pub enum VenvError {
    #[error("[VT100] {} is not a venv/virtualenv", .path.display())]
    NotAnEnvironment { path: PathBuf },
    #[error("[VT200] {builder} failed to create the environment:\n{output}")]
    ConstructionFailure { builder: &'static str, output: String },
    #[error("[VT300] {program} exited with {}:\n{output}", describe_code(.code))]
    SubprocessFailure {
        program: String,
        code: Option<i32>,
        output: String,
    },
    #[error("[VT400] python executable `{}` not found", .requested.display())]
    ExecutableNotFound { requested: PathBuf },
    #[error("[VT410] expected exactly one of module, code or script; got {supplied}")]
    AmbiguousBuilderArguments { supplied: usize },
    #[error("[VT500] failed to remove temporary environment {}: {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed or timed out)".to_string(),
    }
}

impl VenvError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAnEnvironment { .. } => "VT100",
            Self::ConstructionFailure { .. } => "VT200",
            Self::SubprocessFailure { .. } => "VT300",
            Self::ExecutableNotFound { .. } => "VT400",
            Self::AmbiguousBuilderArguments { .. } => "VT410",
            Self::Cleanup { .. } => "VT500",
            Self::Other(_) => "VT900",
        }
    }

    /// Errors the caller can fix by passing different arguments.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotAnEnvironment { .. }
                | Self::ExecutableNotFound { .. }
                | Self::AmbiguousBuilderArguments { .. }
        )
    }
}

impl From<std::io::Error> for VenvError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_their_code() {
        let err = VenvError::NotAnEnvironment {
            path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(err.code(), "VT100");
        assert_eq!(err.to_string(), "[VT100] /tmp/x is not a venv/virtualenv");
        assert!(err.is_user_error());

        let err = VenvError::SubprocessFailure {
            program: "python".into(),
            code: None,
            output: "boom".into(),
        };
        assert!(err.to_string().contains("killed or timed out"));
        assert!(!err.is_user_error());
    }
}
