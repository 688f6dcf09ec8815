// Configuration Normalizer
// Folds structured `env` blocks into the flat list form used by matrix expansion

use crate::config::models::{value_to_list, Axis, RawConfig};

use serde_yaml::Value;

/// Normalizer for raw configurations
pub struct ConfigNormalizer;

impl ConfigNormalizer {
    /// Flatten `env: {global: ..., matrix: [...]}` into `env: [...]`
    ///
    /// Every matrix variant gets the global assignments appended, separated by
    /// a space. A structured block without variants becomes a single entry
    /// holding only the globals. Any other `env` form passes through.
    pub fn normalize(mut config: RawConfig) -> RawConfig {
        let key = Axis::Env.key();
        let Some(Value::Mapping(env)) = config.get(key) else {
            return config;
        };

        let global = env
            .get("global")
            .map(|g| value_to_list(g).join(" "))
            .unwrap_or_default();
        let variants = env.get("matrix").map(value_to_list);

        let flattened: Vec<String> = match variants {
            Some(variants) => variants
                .into_iter()
                .map(|variant| join_nonempty(&variant, &global))
                .collect(),
            None => vec![global],
        };

        config.insert(key, Value::from(flattened));
        config
    }
}

fn join_nonempty(variant: &str, global: &str) -> String {
    match (variant.is_empty(), global.is_empty()) {
        (_, true) => variant.to_string(),
        (true, false) => global.to_string(),
        (false, false) => format!("{} {}", variant, global),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::ConfigLoader;
    use std::path::Path;

    fn parse(source: &str) -> RawConfig {
        ConfigLoader::parse(source, Path::new(".travis.yml")).unwrap()
    }

    #[test]
    fn test_flattens_global_and_matrix() {
        let config = ConfigNormalizer::normalize(parse(
            "env:\n  global: SECURE=1\n  matrix:\n    - DB=mysql\n    - DB=pg\n",
        ));
        assert_eq!(
            config.get("env"),
            Some(&Value::from(vec!["DB=mysql SECURE=1", "DB=pg SECURE=1"]))
        );
    }

    #[test]
    fn test_global_list_is_space_joined() {
        let config = ConfigNormalizer::normalize(parse(
            "env:\n  global:\n    - A=1\n    - B=2\n  matrix:\n    - C=3\n",
        ));
        assert_eq!(config.get("env"), Some(&Value::from(vec!["C=3 A=1 B=2"])));
    }

    #[test]
    fn test_matrix_without_global() {
        let config = ConfigNormalizer::normalize(parse("env:\n  matrix:\n    - X=1\n    - X=2\n"));
        assert_eq!(config.get("env"), Some(&Value::from(vec!["X=1", "X=2"])));
    }

    #[test]
    fn test_global_without_matrix() {
        let config = ConfigNormalizer::normalize(parse("env:\n  global: A=1\n"));
        assert_eq!(config.get("env"), Some(&Value::from(vec!["A=1"])));
    }

    #[test]
    fn test_plain_env_passes_through() {
        let original = parse("env:\n  - XXX=1\n  - XXX=2\nscript: rake\n");
        assert_eq!(ConfigNormalizer::normalize(original.clone()), original);

        let scalar = parse("env: FOO=bar\n");
        assert_eq!(ConfigNormalizer::normalize(scalar.clone()), scalar);
    }

    #[test]
    fn test_absent_env_is_noop() {
        let config = parse("rvm: 2.0.0\n");
        assert_eq!(ConfigNormalizer::normalize(config.clone()), config);
    }
}
