//! Domain Module
//!
//! Transport-independent types: decoded samples, sensor configuration,
//! persisted settings and the sample decoders.

pub mod decoder;
pub mod models;
pub mod sensors;
pub mod settings;
