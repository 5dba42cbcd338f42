//! Deploy-on-demand edge for a multi-tenant hosting platform.
//!
//! One process hosts three cooperating surfaces:
//!
//! - The public **edge proxy**: routes each request by domain to object
//!   storage (static projects) or the container cluster (dynamic projects),
//!   and turns a dead dynamic upstream into a wake-up event plus a
//!   "starting" page.
//! - The **orchestrator API**: hands scheduled deployments their signed
//!   lifecycle tokens and receives the webhook callbacks that drive the
//!   forward-only deployment state machine. Token expiry doubles as the
//!   phase timeout.
//! - The **event stream**: a bounded in-process broker with consumer groups
//!   carrying wake-up hints and normalized lifecycle facts between the
//!   surfaces and their consumers.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod lifecycle;
pub mod notify;
pub mod orchestrator;
pub mod pages;
pub mod pool;
pub mod proxy;
pub mod records;
pub mod stream;
pub mod task;
pub mod token;
pub mod wakeup;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
