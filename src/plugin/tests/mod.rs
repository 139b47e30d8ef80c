//! Plugin System Tests
//!
//! Shared mock implementations for unit tests across the runtime.
