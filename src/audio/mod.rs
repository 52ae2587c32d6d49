//! # Audio Module
//!
//! Everything that happens to a stage recording before minima are searched for.
//!
//! ## Key Components:
//! - **Decoder**: base64 payload → mono `f32` PCM + sample rate
//! - **Filter**: zero-phase Butterworth low-pass (`SignalConditioner`)
//! - **Envelope**: Hilbert amplitude envelope normalized to `[0, 1]`

pub mod decoder;    // Payload decoding (wav, raw PCM)
pub mod envelope;   // Analytic-signal envelope
pub mod filter;     // Low-pass conditioning

pub use decoder::{AudioDecoder, DecodedAudio};
pub use envelope::EnvelopeExtractor;
pub use filter::SignalConditioner;
