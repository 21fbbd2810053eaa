//! sdns - a local DNS override proxy.
//!
//! Answers configured names directly and forwards everything else to a
//! list of upstream resolvers, promoting whichever one last answered.
//! The library is exposed for the binary, integration tests and benchmarks.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod message;
pub mod proxy;
pub mod rules;
pub mod self_ip;
pub mod stats;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use error::Error;
pub use proxy::Proxy;
pub use rules::{RuleCheck, RuleSet, Target};
