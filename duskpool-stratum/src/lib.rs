//! Duskpool Stratum Crate
//!
//! Houses the Job Registry (C1), Template Cache (C2), Stratum Session
//! Layer (C5), and Shares Manager + VarDiff controller (C6), plus the
//! `MiningPool` that wires them together with the Upstream Feed.

pub mod cache;
pub mod pool;
pub mod registry;
pub mod session;
pub mod shares;

pub use cache::{SubmitResult, TemplateCache, TemplateCacheError};
pub use pool::{MiningPool, StratumPort};
pub use registry::JobRegistry;
pub use session::{ConnectionState, PortPolicy, SessionError, StratumSession};
pub use shares::{SharesManager, SharesManagerConfig, VARDIFF_TOLERANCES, VARDIFF_WINDOWS_MINUTES};
