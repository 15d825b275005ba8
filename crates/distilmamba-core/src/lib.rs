//! # distilmamba-core
//!
//! The base sequence model and the plumbing around it: a trainable Mamba
//! implementation with per-tensor freezing, safetensors weight I/O,
//! tokenizer wrapper and device selection.
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |

pub mod device;
pub mod error;
pub mod mamba;
pub mod model;
pub mod param;
pub mod tokenizer;
pub mod weights;

pub use device::select_device;
pub use error::{CoreError, CoreResult};
pub use mamba::{Mamba, MambaConfig};
pub use model::SequenceModel;
pub use param::Parameter;
pub use tokenizer::{PaddedEncoding, Tokenizer};
