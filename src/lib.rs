//! Opt-in per-request profiler for axum services.
//!
//! [`profile_middleware`] decides per request whether to profile it, runs
//! the handler inside a capture scope (RPC timings, log lines, CPU profile)
//! and stores the result under a fresh [`RequestId`] for a few minutes. The
//! response carries the id, in headers or, for redirects, in the target's
//! query string, so a client can later fetch the whole chain of profiles
//! from `/mini_profiler/request`.
//!
//! ```no_run
//! # async fn run(app: axum::Router) -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use mini_profiler::{server, Profiler, ProfilerConfig};
//!
//! let config = ProfilerConfig::from_env()?;
//! let store = mini_profiler::store::connect(&config).await?;
//! let profiler = Arc::new(Profiler::builder(config).with_store(store).build());
//! let app = server::install(app, profiler);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod correlation;
pub mod cpuprofile;
pub mod error;
pub mod id;
pub mod interceptor;
pub mod mode;
pub mod policy;
pub mod query;
pub mod record;
pub mod server;
pub mod store;

pub use capture::{CaptureLayer, ProfileContext, RpcEvent};
pub use config::ProfilerConfig;
pub use error::{CaptureError, ConfigError, QueryError, StoreError};
pub use id::RequestId;
pub use interceptor::{profile_middleware, Profiler, ProfilerBuilder};
pub use mode::Mode;
pub use policy::{AuthenticatedUser, CallerInfo, DefaultPolicy, ProfilingPolicy};
pub use query::{query, query_list, QueryEntry};
pub use record::ProfileRecord;
pub use store::{MemoryStore, ProfileStore, RedisStore};
