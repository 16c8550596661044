//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(ShardsetError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; op_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, ShardsetError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err(ShardsetError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::ShardsetError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        op_timeout_ms: u64,
        backer_path: String,
        load_factor: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                op_timeout_ms: 250,
                backer_path: "/tmp/shardset.wal".into(),
                load_factor: 0.75,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), ShardsetError> {
        let config =
            parsed_config!(None => TestConfig; op_timeout_ms, backer_path)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), ShardsetError> {
        let config_str = Some("op_timeout_ms = 500");
        let config =
            parsed_config!(config_str => TestConfig; op_timeout_ms, load_factor)?;
        let ref_config = TestConfig {
            op_timeout_ms: 500,
            backer_path: "/tmp/shardset.wal".into(),
            load_factor: 0.75,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("who_am_i = 999");
        assert!(parsed_config!(config_str => TestConfig; op_timeout_ms).is_err());
    }
}
