//! Domain layer - Core business logic with no external dependencies
//!
//! This layer contains the value objects shared by every part of the relay:
//! session keys, dialog turns, generation parameters, and typed ids.

pub mod value_objects;
