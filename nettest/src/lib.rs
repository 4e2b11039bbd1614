//! Helpers for tests that need a real network: privilege setup and a veth
//! pair with one address on each end.

pub mod command;
pub mod runner;
pub mod veth;

pub use runner::{DEV_PREFIX, Host, HostPair, IP_PREFIX, TEST_TIMEOUT, run_test_with_pair};
