//! ragdb-embed
//!
//! Encoder backends behind `ragdb_core::traits::Encoder`. The backend is
//! picked once from configuration; `APP_USE_FAKE_EMBEDDINGS=1` forces the
//! deterministic fake.
#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

use std::sync::Arc;
use tracing::info;

use ragdb_core::config::{EncoderBackend, EncoderConfig};
use ragdb_core::error::Result;
use ragdb_core::traits::Encoder;

mod analyzer;
mod fake;
mod hashing;
#[cfg(feature = "model")]
mod device;
#[cfg(feature = "model")]
mod model;
#[cfg(feature = "model")]
mod pool;
#[cfg(feature = "model")]
mod tokenize;

pub use analyzer::AnalyzerEncoder;
pub use fake::FakeEncoder;
#[cfg(feature = "model")]
pub use model::ModelEncoder;
#[cfg(feature = "model")]
pub use pool::masked_mean_l2;

pub fn use_fake_embeddings() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn build_encoder(cfg: &EncoderConfig) -> Result<Arc<dyn Encoder>> {
    let encoder: Arc<dyn Encoder> = match cfg.backend {
        EncoderBackend::Analyzer => Arc::new(AnalyzerEncoder::new(cfg.dim, cfg.max_tokens)),
        EncoderBackend::Fake => Arc::new(FakeEncoder::new(cfg.dim, cfg.max_tokens)),
        #[cfg(feature = "model")]
        EncoderBackend::Model => Arc::new(ModelEncoder::load(cfg.model_dir.as_deref(), cfg.max_tokens)?),
        #[cfg(not(feature = "model"))]
        EncoderBackend::Model => {
            return Err(ragdb_core::error::Error::InvalidConfig("encoder.backend = \"model\" needs the `model` cargo feature".into()))
        }
    };
    info!(encoder = encoder.name(), dim = encoder.dim(), max_tokens = encoder.max_tokens(), "encoder ready");
    Ok(encoder)
}

/// Encoder from configuration, unless fake embeddings are forced.
pub fn get_default_encoder(cfg: &EncoderConfig) -> Result<Arc<dyn Encoder>> {
    if use_fake_embeddings() {
        return build_encoder(&EncoderConfig { backend: EncoderBackend::Fake, ..cfg.clone() });
    }
    build_encoder(cfg)
}
