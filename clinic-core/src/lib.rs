//! Clinic Core - Shared Types
//!
//! Error taxonomy, configuration, the per-call middleware context and the
//! cache-key convention. Every other crate in the workspace depends on this.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;

pub use clock::{duration_millis, Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, PipelineConfig};
pub use context::{cache_key, tables, MiddlewareContext, Operation};
pub use error::{
    AuthError, CacheError, CacheResult, ClinicError, ClinicResult, ConfigError, CsrfError,
    MirrorError, StorageError,
};
