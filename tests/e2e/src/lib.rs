//! End-to-end test support for the capture pipeline: a scripted mock LLM and
//! a harness wiring the full stack against temporary stores.

pub mod harness;
pub mod mocks;
