//! # distilmamba-hub
//!
//! Downloads pretrained model files from the Hugging Face Hub into a local
//! cache with SHA-256 sidecar metadata.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use distilmamba_hub::{ModelCache, ModelDownloader};
//!
//! #[tokio::main]
//! async fn main() -> distilmamba_hub::HubResult<()> {
//!     let cache = ModelCache::new("~/.cache/distilmamba")?;
//!     let downloader = ModelDownloader::new(cache)?;
//!     let paths = downloader.pull("state-spaces/mamba-130m-hf", "main", None).await?;
//!     println!("Downloaded {} files", paths.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod download;
pub mod error;
pub mod integrity;

pub use cache::{FileMetadata, ModelCache};
pub use download::{ModelDownloader, REQUIRED_MODEL_FILES};
pub use error::{HubError, HubResult};
pub use integrity::evict_corrupt;
