//! Load harness for the EasyTrack upload endpoint.
//!
//! Every virtual user turns its worker index and a payload file into a
//! [`generator::RequestVariableSet`], uploads it through a
//! [`sampler::Sampler`] and reports the response time.

pub mod generator;
pub mod model;
pub mod provision;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod worker;
