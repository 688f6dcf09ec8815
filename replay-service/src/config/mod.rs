// Configuration Module
// Loading, normalization and the data model of a CI build configuration

pub mod loader;
pub mod models;
pub mod normalize;

pub use loader::{ConfigError, ConfigLoader, DEFAULT_CONFIG_FILE};
pub use models::{Axis, Cell, RawConfig, MATRIX_KEY, SECTIONS, UNDERSTOOD_KEYS};
pub use normalize::ConfigNormalizer;
