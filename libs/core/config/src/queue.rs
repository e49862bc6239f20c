use crate::{ConfigError, FromEnv, env_or_default};

/// Consumer identity for the gateway's stream consumers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub consumer_name: String,
    pub consumer_group: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            consumer_name: "gateway_worker".to_string(),
            consumer_group: "gateway_consumers".to_string(),
        }
    }
}

impl FromEnv for QueueSettings {
    /// - QUEUE_CONSUMER_NAME: defaults to `gateway_worker`
    /// - QUEUE_CONSUMER_GROUP: defaults to `gateway_consumers`
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let consumer_group = env_or_default("QUEUE_CONSUMER_GROUP", &defaults.consumer_group);
        if consumer_group.trim().is_empty() {
            return Err(ConfigError::ParseError {
                key: "QUEUE_CONSUMER_GROUP".to_string(),
                details: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            consumer_name: env_or_default("QUEUE_CONSUMER_NAME", &defaults.consumer_name),
            consumer_group,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_settings_defaults() {
        temp_env::with_vars(
            [
                ("QUEUE_CONSUMER_NAME", None::<&str>),
                ("QUEUE_CONSUMER_GROUP", None::<&str>),
            ],
            || {
                assert_eq!(QueueSettings::from_env().unwrap(), QueueSettings::default());
            },
        );
    }

    #[test]
    fn test_queue_settings_override() {
        temp_env::with_vars(
            [
                ("QUEUE_CONSUMER_NAME", Some("worker-7")),
                ("QUEUE_CONSUMER_GROUP", Some("billing")),
            ],
            || {
                let settings = QueueSettings::from_env().unwrap();
                assert_eq!(settings.consumer_name, "worker-7");
                assert_eq!(settings.consumer_group, "billing");
            },
        );
    }

    #[test]
    fn test_queue_settings_rejects_blank_group() {
        temp_env::with_var("QUEUE_CONSUMER_GROUP", Some("  "), || {
            let err = QueueSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_CONSUMER_GROUP"));
        });
    }
}
