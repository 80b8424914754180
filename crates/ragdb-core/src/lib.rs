#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod cancel;
pub mod chunker;
pub mod config;
pub mod error;
pub mod filter;
pub mod store;
pub mod traits;
pub mod types;

pub use cancel::CancelFlag;
pub use chunker::{Chunker, ChunkingConfig};
pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use filter::Filter;
