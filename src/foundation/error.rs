pub type ResolveResult<T> = Result<T, ResolveError>;

/// Outcome classification for a failed resolution.
///
/// `Aborted` is not a failure: it means the abort token fired and the caller
/// should discard the in-flight frame. Every other variant terminates the
/// render tree.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("render aborted")]
    Aborted,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("effect error: {0}")]
    Effect(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    /// GPU allocation failed mid-dispatch. Never user-visible: the resolver
    /// retries the request with GPU rendering disabled, or converts to an
    /// effect failure when the effect renders on GPU only.
    #[error("out of video memory")]
    OutOfGpuMemory,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResolveError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn effect(msg: impl Into<String>) -> Self {
        Self::Effect(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// True when the error is the abort signal rather than a real failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
