/// Errors raised by the inference core.
///
/// Configuration errors are detected while elements start or negotiate caps
/// and stop the element. Engine and post-processing errors are logged by the
/// scheduler and never cost a buffer.
#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error(
        "All image formats and memory types for model-instance-id '{key}' must be the same, \
         got {requested} but the first element accepted {accepted}"
    )]
    FormatMismatch {
        key: String,
        accepted: String,
        requested: String,
    },
    #[error("There is no master inference element for '{0}', check that 'model' is set")]
    NoMaster(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Inference engine failure: {0}")]
    Engine(String),
    #[error("Post-processing failed: {0}")]
    PostProcessing(String),
}

impl InferenceError {
    /// Whether the error should prevent the element from starting.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            InferenceError::Configuration(_)
                | InferenceError::FormatMismatch { .. }
                | InferenceError::NoMaster(_)
        )
    }
}
