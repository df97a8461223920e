use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::client::{Client, ConstrainedValue};
use crate::constraints::Constraints;
use crate::convert::{ConvertError, FromConfigValue};

const ERR_COUNT_LOG_THRESHOLD: i64 = 1000;

#[derive(Debug, thiserror::Error)]
enum MatchError {
    #[error("key not present")]
    KeyNotPresent,
    #[error("no matching constraint in key")]
    NoMatchingConstraint,
}

/// A typed default that only applies under `constraints`.
#[derive(Debug, Clone)]
pub struct TypedConstrainedValue<T> {
    pub constraints: Constraints,
    pub value: T,
}

enum Matched<'a, T> {
    Raw(&'a Value),
    Typed(T),
}

fn find_match<'a, T: Clone>(
    values: &'a [ConstrainedValue],
    defaults: &[TypedConstrainedValue<T>],
    precedence: &[Constraints],
) -> Result<Matched<'a, T>, MatchError> {
    if values.is_empty() && defaults.is_empty() {
        return Err(MatchError::KeyNotPresent);
    }
    for constraints in precedence {
        let raw = values.iter().find(|cv| cv.constraints == *constraints);
        if let Some(cv) = raw {
            return Ok(Matched::Raw(&cv.value));
        }
        let typed = defaults.iter().find(|cv| cv.constraints == *constraints);
        if let Some(cv) = typed {
            return Ok(Matched::Typed(cv.value.clone()));
        }
    }
    Err(MatchError::NoMatchingConstraint)
}

/// Typed lookups over a [`Client`].
pub struct Collection {
    client: Arc<dyn Client>,
    err_count: AtomicI64,
}

impl Collection {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            err_count: AtomicI64::new(-1),
        }
    }

    // Logs the first few errors and then one in every threshold.
    fn throttle_log(&self) -> bool {
        let count = self.err_count.fetch_add(1, Ordering::Relaxed) + 1;
        count < ERR_COUNT_LOG_THRESHOLD || count % ERR_COUNT_LOG_THRESHOLD == 0
    }

    pub fn has_key(&self, key: &str) -> bool {
        !self.client.get_value(key).is_empty()
    }

    /// Resolves `key` with a caller-supplied converter. Never fails: a
    /// missing key, an unmatched constraint or a failed conversion yields
    /// `default`.
    pub fn get_with<T, F>(
        &self,
        key: &str,
        default: T,
        constrained_defaults: &[TypedConstrainedValue<T>],
        convert: F,
        precedence: &[Constraints],
    ) -> T
    where
        T: Clone,
        F: Fn(&Value) -> Result<T, ConvertError>,
    {
        let values = self.client.get_value(key);
        let global_default;
        let defaults = if constrained_defaults.is_empty() {
            global_default = [TypedConstrainedValue {
                constraints: Constraints::global(),
                value: default.clone(),
            }];
            &global_default[..]
        } else {
            constrained_defaults
        };

        match find_match(&values, defaults, precedence) {
            Err(err) => {
                if self.throttle_log() {
                    debug!(
                        key,
                        error = %err,
                        "No such key in dynamic config, using default"
                    );
                }
                default
            }
            Ok(Matched::Typed(value)) => value,
            Ok(Matched::Raw(raw)) => match convert(raw) {
                Ok(value) => value,
                Err(err) => {
                    if self.throttle_log() {
                        warn!(
                            key,
                            value = %raw,
                            error = %err,
                            "Failed to convert value, using default"
                        );
                    }
                    default
                }
            },
        }
    }

    pub fn get<T>(&self, key: &str, default: T, precedence: &[Constraints]) -> T
    where
        T: FromConfigValue + Clone,
    {
        self.get_with(key, default, &[], T::from_config_value, precedence)
    }

    pub fn get_int(
        &self,
        key: &str,
        default: i64,
        precedence: &[Constraints],
    ) -> i64 {
        self.get(key, default, precedence)
    }

    pub fn get_float(
        &self,
        key: &str,
        default: f64,
        precedence: &[Constraints],
    ) -> f64 {
        self.get(key, default, precedence)
    }

    pub fn get_bool(
        &self,
        key: &str,
        default: bool,
        precedence: &[Constraints],
    ) -> bool {
        self.get(key, default, precedence)
    }

    pub fn get_string(
        &self,
        key: &str,
        default: &str,
        precedence: &[Constraints],
    ) -> String {
        self.get(key, default.to_string(), precedence)
    }

    pub fn get_duration(
        &self,
        key: &str,
        default: Duration,
        precedence: &[Constraints],
    ) -> Duration {
        self.get(key, default, precedence)
    }

    pub fn get_map(
        &self,
        key: &str,
        default: Map<String, Value>,
        precedence: &[Constraints],
    ) -> Map<String, Value> {
        self.get(key, default, precedence)
    }
}
