//! Image Relay
//!
//! An image-delivery orchestrator. Given a request for a transformed image it
//! verifies the request signature, looks for a cached result, loads the
//! original, transforms it and caches the result, all across pluggable
//! backends and under timeout and concurrency budgets.
//!
//! # Architecture
//!
//! - [`Blob`]: immutable content holder with byte, stream and seekable-stream
//!   access plus content-type sniffing
//! - [`Loader`] / [`Storage`]: fetch originals; cache originals and results
//! - [`Processor`]: transforms a blob, or declines
//! - [`Signer`] / [`ResultKey`]: request authentication and cache-key derivation
//! - [`Orchestrator`]: runs the request pipeline
//! - [`RelayServer`]: HTTP front end
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use image_relay::{HttpLoader, ImageRequest, MemoryStorage, Orchestrator};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::builder()
//!     .loader(HttpLoader::new("https://origin.example.com/images")?)
//!     .result_storage(MemoryStorage::new().with_max_size(256 * 1024 * 1024))
//!     .allow_unsafe(true)
//!     .build()?;
//!
//! let request = ImageRequest::new("cat.jpg", "width:300")?.unsafe_request();
//! let response = orchestrator.serve(request).await?;
//! println!("{} bytes of {}", response.blob.size(), response.blob.content_type());
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Services usually start from YAML, see [`RelayConfig`]:
//!
//! ```yaml
//! listen_address: "0.0.0.0:8000"
//! secret: "change-me"
//! process_concurrency: 8
//! auto_webp: true
//! loaders:
//!   - type: http
//!     base_url: "https://origin.example.com/images"
//! result_storages:
//!   - type: file
//!     base_dir: /var/cache/image-relay
//! ```

pub mod backend;
pub mod blob;
pub mod config;
pub mod error;
pub mod metrics;
pub mod options;
pub mod orchestrator;
pub mod params;
pub mod processor;
pub mod response;
pub mod result_key;
pub mod server;
pub mod signer;

pub use backend::{FileStorage, HttpLoader, Loader, MemoryStorage, Storage, StoredBlob};
pub use blob::{sniff_content_type, Blob};
pub use config::{BackendConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use metrics::RelayMetrics;
pub use options::{OrchestratorBuilder, Setting, Settings};
pub use orchestrator::{Orchestrator, Stage};
pub use params::{AcceptHint, ImageRequest, OutputFormat, Params};
pub use processor::{Processed, Processor};
pub use response::{CachePolicy, CacheStatus, ErrorResponse, RelayResponse};
pub use result_key::{DefaultResultKey, HashedResultKey, ResultKey};
pub use server::RelayServer;
pub use signer::{HmacSigner, Signer};
