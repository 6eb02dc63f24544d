//! Reference modules shipped with the daemon.

pub mod pulse_matrix;
pub mod voice_box;

use kari_core::ModuleCatalog;

pub use pulse_matrix::PulseMatrix;
pub use voice_box::VoiceBox;

/// Every module implementation this binary can instantiate.
pub fn catalog() -> ModuleCatalog {
    ModuleCatalog::new()
        .with(pulse_matrix::TYPE_NAME, || Ok(Box::new(PulseMatrix::new())))
        .with(voice_box::TYPE_NAME, || Ok(Box::new(VoiceBox::new())))
}
