//! Adapters for services under test.
//!
//! ## Built-in Targets
//!
//! The only built-in target is [`http::HttpTarget`], a key-value service that speaks plain HTTP.
//! Its configuration lives in the `[target]` section of a sweep, see the module documentation.
//!
//! ## Custom Targets
//!
//! To drive a different kind of service, implement [`Target`] and [`TargetHandle`] for it and
//! hand it to [`crate::bench::sweep`]. The handle only needs to perform a single exchange per call
//! and report the status code of the reply; timing and classification are done by the engine.
//!
//! [`Target`]: crate::Target
//! [`TargetHandle`]: crate::TargetHandle

pub mod http;

#[cfg(test)]
pub(crate) mod mock;
