pub mod assembler;
pub mod backend;
pub mod config;
pub mod error;
pub mod fragment;
pub mod transcript;

// Re-export main types for convenience
pub use assembler::{validate_input, AssemblerOptions, ReplyMode, ResponseAssembler, Snapshot};
pub use backend::{BackendKind, CliBackend, HttpBackend, ModelBackend, ModelRequest};
pub use config::{Config, Overrides, Settings};
pub use error::{ChatError, ERROR_MARKER};
pub use fragment::Fragment;
pub use transcript::{Role, Transcript, Turn};

/// Build the assembler described by `settings`.
pub fn assembler_from_settings(settings: &Settings) -> ResponseAssembler {
    ResponseAssembler::new(
        settings.transcript(),
        backend::from_settings(settings),
        settings.assembler_options(),
    )
}
