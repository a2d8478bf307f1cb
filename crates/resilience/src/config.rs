// Startup configuration
//
// Loaded once from environment variables and handed to the components.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionConfig, EndpointLimits};
use crate::error::ResilienceError;
use crate::reliability::{PolicyOverride, PolicyRegistry, PolicyTemplate};
use crate::worker::WorkerPoolConfig;

/// Prefix shared by every variable
pub const ENV_PREFIX: &str = "BULWARK_";

/// Configuration for the whole core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Per-template retry overrides
    #[serde(default)]
    pub retry_overrides: HashMap<PolicyTemplate, PolicyOverride>,

    /// Per-endpoint admission quotas
    #[serde(default)]
    pub rate_limits: HashMap<String, EndpointLimits>,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
}

impl CoreConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `BULWARK_RETRY_<TEMPLATE>_MAX_ATTEMPTS`, `_BASE_DELAY_MS`, `_MAX_DELAY_MS`:
    ///   retry template overrides, e.g. `BULWARK_RETRY_STANDARD_API_MAX_ATTEMPTS=5`
    /// - `BULWARK_RATE_LIMITS`: `endpoint=rpm/tpm/rpd/tpd` entries separated by `,`
    /// - `BULWARK_ADMISSION_MAX_WAIT_MS`: longest admission wait (default: 30000)
    /// - `BULWARK_WORKERS_MIN` / `BULWARK_WORKERS_MAX`: worker bounds (default: 1 / 4)
    /// - `BULWARK_QUEUE_CAPACITY`: task queue capacity (default: 1000)
    /// - `BULWARK_TASK_TIMEOUT_MS`: default task timeout (default: 300000)
    /// - `BULWARK_SCALE_INTERVAL_MS`: auto-scaling tick (default: 5000)
    pub fn from_env() -> Result<Self, ResilienceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ResilienceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Self::default();

        for template in PolicyTemplate::ALL {
            let prefix = format!("RETRY_{}", template.as_str().to_ascii_uppercase());
            let o = PolicyOverride {
                max_attempts: vars.parse(&format!("{prefix}_MAX_ATTEMPTS"))?,
                base_delay: vars.millis(&format!("{prefix}_BASE_DELAY_MS"))?,
                max_delay: vars.millis(&format!("{prefix}_MAX_DELAY_MS"))?,
            };
            if !o.is_empty() {
                config.retry_overrides.insert(template, o);
            }
        }

        if let Some(raw) = vars.get("RATE_LIMITS") {
            config.rate_limits = parse_rate_limits(&raw)
                .map_err(|e| vars.invalid("RATE_LIMITS", &raw, e))?;
        }

        if let Some(max_wait) = vars.millis("ADMISSION_MAX_WAIT_MS")? {
            config.admission.max_wait = max_wait;
        }

        let pool = &mut config.worker_pool;
        if let Some(min) = vars.parse("WORKERS_MIN")? {
            pool.min_workers = min;
        }
        if let Some(max) = vars.parse("WORKERS_MAX")? {
            pool.max_workers = max;
        }
        if let Some(capacity) = vars.parse("QUEUE_CAPACITY")? {
            pool.queue_capacity = capacity;
        }
        if let Some(timeout) = vars.millis("TASK_TIMEOUT_MS")? {
            pool.default_task_timeout = timeout;
        }
        if let Some(interval) = vars.millis("SCALE_INTERVAL_MS")? {
            pool.scale_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ResilienceError> {
        self.worker_pool.validate()?;
        for template in PolicyTemplate::ALL {
            self.template_policy_check(template)?;
        }
        Ok(())
    }

    fn template_policy_check(&self, template: PolicyTemplate) -> Result<(), ResilienceError> {
        match self.retry_overrides.get(&template) {
            Some(o) => template.policy().with_override(o).validate(),
            None => Ok(()),
        }
    }

    /// Policy registry with the configured overrides applied
    pub fn policy_registry(&self) -> PolicyRegistry {
        PolicyRegistry::with_overrides(&self.retry_overrides)
    }

    /// Admission config with the configured endpoint quotas merged in
    pub fn admission_config(&self) -> AdmissionConfig {
        let mut admission = self.admission.clone();
        for (endpoint, limits) in &self.rate_limits {
            admission
                .endpoints
                .insert(endpoint.clone(), *limits);
        }
        admission
    }
}

/// Parse `endpoint=rpm/tpm/rpd/tpd,...`
pub fn parse_rate_limits(raw: &str) -> Result<HashMap<String, EndpointLimits>, ResilienceError> {
    let mut limits = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (endpoint, value) = entry.split_once('=').ok_or_else(|| {
            ResilienceError::configuration(format!("expected endpoint=limits, got '{entry}'"))
        })?;
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(ResilienceError::configuration(format!(
                "missing endpoint name in '{entry}'"
            )));
        }
        limits.insert(endpoint.to_string(), value.parse()?);
    }
    Ok(limits)
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ResilienceError>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| self.invalid(name, &raw, e)),
        }
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ResilienceError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn invalid<E>(&self, name: &str, raw: &str, cause: E) -> ResilienceError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceError::configuration(format!("invalid value '{raw}' for {ENV_PREFIX}{name}"))
            .with_code("INVALID_CONFIG")
            .with_details(serde_json::json!({ "variable": format!("{ENV_PREFIX}{name}") }))
            .with_cause(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = CoreConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.admission.max_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_reads_all_variables() {
        let config = CoreConfig::from_lookup(lookup(&[
            ("BULWARK_RETRY_STANDARD_API_MAX_ATTEMPTS", "5"),
            ("BULWARK_RETRY_STANDARD_API_BASE_DELAY_MS", "250"),
            ("BULWARK_RATE_LIMITS", "chat=60/90000/1000/0, embed=600"),
            ("BULWARK_ADMISSION_MAX_WAIT_MS", "5000"),
            ("BULWARK_WORKERS_MIN", "2"),
            ("BULWARK_WORKERS_MAX", "16"),
            ("BULWARK_QUEUE_CAPACITY", "50"),
            ("BULWARK_TASK_TIMEOUT_MS", "1000"),
            ("BULWARK_SCALE_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        let o = &config.retry_overrides[&PolicyTemplate::StandardApi];
        assert_eq!(o.max_attempts, Some(5));
        assert_eq!(o.base_delay, Some(Duration::from_millis(250)));
        assert!(o.max_delay.is_none());
        assert!(!config.retry_overrides.contains_key(&PolicyTemplate::Background));

        assert_eq!(config.rate_limits["chat"].tokens_per_minute, 90_000);
        assert_eq!(config.rate_limits["embed"].requests_per_minute, 600);
        assert_eq!(config.admission.max_wait, Duration::from_secs(5));
        assert_eq!(config.worker_pool.min_workers, 2);
        assert_eq!(config.worker_pool.max_workers, 16);
        assert_eq!(config.worker_pool.queue_capacity, 50);
        assert_eq!(config.worker_pool.default_task_timeout, Duration::from_secs(1));
        assert_eq!(config.worker_pool.scale_interval, Duration::from_millis(250));

        let policy = config.policy_registry().template(PolicyTemplate::StandardApi);
        assert_eq!(policy.max_attempts, 5);
        assert!(config.admission_config().endpoints.contains_key("chat"));
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = CoreConfig::from_lookup(lookup(&[("BULWARK_WORKERS_MAX", "many")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.message.contains("BULWARK_WORKERS_MAX"));
        assert_eq!(err.details.unwrap()["variable"], "BULWARK_WORKERS_MAX");
    }

    #[test]
    fn test_cross_field_validation() {
        let err = CoreConfig::from_lookup(lookup(&[
            ("BULWARK_WORKERS_MIN", "8"),
            ("BULWARK_WORKERS_MAX", "2"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);

        let err = CoreConfig::from_lookup(lookup(&[("BULWARK_RATE_LIMITS", "chat")])).unwrap_err();
        assert!(err.message.contains("BULWARK_RATE_LIMITS"));
    }

    #[test]
    fn test_parse_rate_limits() {
        let limits = parse_rate_limits("a=1/2/3/4,,b=5").unwrap();
        assert_eq!(limits["a"], EndpointLimits::new(1, 2, 3, 4));
        assert_eq!(limits["b"].requests_per_minute, 5);
        assert!(parse_rate_limits("=1").is_err());
    }
}
