//! Utility functions shared by the library and its binaries.

pub mod bootstrap;
