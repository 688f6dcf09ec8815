// Matrix Expansion
// Expands combinator axes into concrete build cells, then applies exclude/include

use crate::config::models::{Axis, Cell, RawConfig};
use crate::config::normalize::ConfigNormalizer;

use serde_yaml::Value;

/// Ordered sequence of build cells
pub type Matrix = Vec<Cell>;

/// Builder for build matrices
pub struct MatrixBuilder;

impl MatrixBuilder {
    /// Expand a normalized configuration into its build cells
    ///
    /// Axes are crossed in `Axis::ALL` order with later axes varying fastest.
    /// Exclusions use partial matching against the expanded axis values and
    /// happen before includes are appended. Every resulting cell carries the
    /// non-combinator keys of the configuration underneath its own values.
    pub fn build(config: &RawConfig) -> Matrix {
        let mut matrix: Matrix = vec![Cell::new()];

        for axis in Axis::ALL {
            if let Some(values) = config.get(axis.key()) {
                matrix = Self::cross(&matrix, axis, values);
            }
        }

        let excludes = config.matrix_specs("exclude");
        if !excludes.is_empty() {
            matrix.retain(|cell| !excludes.iter().any(|spec| cell.matches(spec)));
        }

        let base = config.base();
        matrix.extend(
            config
                .matrix_specs("include")
                .iter()
                .map(|include| include.merged_over(&base)),
        );

        matrix.iter().map(|cell| cell.merged_over(&base)).collect()
    }

    /// Normalize and expand a raw configuration in one step
    pub fn expand(config: RawConfig) -> Matrix {
        Self::build(&ConfigNormalizer::normalize(config))
    }

    fn cross(matrix: &[Cell], axis: Axis, values: &Value) -> Matrix {
        let values: Vec<Value> = match values {
            Value::Sequence(items) => items.clone(),
            scalar => vec![scalar.clone()],
        };

        matrix
            .iter()
            .flat_map(|cell| {
                values.iter().map(move |value| {
                    let mut next = cell.clone();
                    next.insert(axis.key(), value.clone());
                    next
                })
            })
            .collect()
    }
}
