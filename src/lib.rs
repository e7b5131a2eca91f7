//! Provider-neutral sampling loop for tool-using agents.
//!
//! The crate keeps one canonical conversation model and translates it to and
//! from heterogeneous backend wire formats through [`providers::base::ProviderAdapter`]
//! implementations. [`agent::Agent`] drives the bounded model-call /
//! tool-dispatch cycle and returns the accumulated transcript on every exit
//! path.

pub mod agent;
pub mod config;
pub mod detection;
pub mod errors;
pub mod models;
pub mod providers;
pub mod telemetry;
pub mod tools;
