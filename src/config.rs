use std::fmt::Display;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::Protocol;
use crate::error::LoadError;
use crate::message::MessageType;
use crate::report::SlaThresholds;
use crate::schedule::{BurstSchedule, JitterMode, Schedule, WaitPolicy};

/// What to do when the registry provisions fewer devices than requested.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartialPolicy {
    #[default]
    Proceed,
    Abort,
}

impl FromStr for PartialPolicy {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "proceed" => Ok(PartialPolicy::Proceed),
            "abort" => Ok(PartialPolicy::Abort),
            other => Err(LoadError::Config(format!(
                "unknown partial provisioning policy '{}', expected proceed or abort",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BurstConfig {
    pub multiplier: f64,
    pub duration_secs: f64,
    pub frequency_secs: f64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            multiplier: 5.0,
            duration_secs: 60.0,
            frequency_secs: 600.0,
        }
    }
}

/// Pause before each device registration, so a large setup does not flood
/// the registry. Later devices wait a little longer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub base_delay_secs: f64,
    /// Upper bound of the uniform jitter added to the base delay.
    pub jitter_secs: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 0.5,
            jitter_secs: 0.2,
        }
    }
}

impl ThrottleConfig {
    /// `base + U[0, jitter] + index / total * 0.5` seconds.
    pub fn delay<R: Rng + ?Sized>(&self, index: usize, total: usize, rng: &mut R) -> Duration {
        let jitter = if self.jitter_secs > 0.0 {
            rng.gen_range(0.0..=self.jitter_secs)
        } else {
            0.0
        };
        let progressive = if total > 0 {
            index as f64 / total as f64 * 0.5
        } else {
            0.0
        };

        Duration::try_from_secs_f64(self.base_delay_secs + jitter + progressive)
            .unwrap_or(Duration::ZERO)
    }
}

/// Endpoints and client options for the registry and protocol adapters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    pub registry_host: String,
    pub registry_port: u16,
    pub registry_username: String,
    pub registry_password: String,
    pub http_adapter_host: String,
    pub http_adapter_port: u16,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub use_tls: bool,
    pub mqtt_tls: bool,
    pub verify_tls: bool,
    pub ca_file: Option<PathBuf>,
    pub request_timeout_secs: f64,
    pub mqtt_connect_timeout_secs: f64,
    pub mqtt_keepalive_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            registry_host: "localhost".to_string(),
            registry_port: 28443,
            registry_username: "hono-client@HONO".to_string(),
            registry_password: "secret".to_string(),
            http_adapter_host: "localhost".to_string(),
            http_adapter_port: 8443,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 8883,
            use_tls: true,
            mqtt_tls: true,
            verify_tls: false,
            ca_file: None,
            request_timeout_secs: 30.0,
            mqtt_connect_timeout_secs: 10.0,
            mqtt_keepalive_secs: 60,
        }
    }
}

impl AdapterConfig {
    fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    pub fn registry_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.scheme(),
            self.registry_host,
            self.registry_port
        )
    }

    pub fn http_adapter_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.scheme(),
            self.http_adapter_host,
            self.http_adapter_port
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn mqtt_connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.mqtt_connect_timeout_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}

/// Everything a load test run consumes. Read-only once a run starts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoadConfig {
    pub tenants: usize,
    pub devices: usize,
    pub protocols: Vec<Protocol>,
    /// Seconds between two sends of one device.
    pub message_interval: f64,
    /// Seconds until the run stops by itself; unset runs until interrupted.
    pub duration: Option<f64>,
    pub jitter_mode: JitterMode,
    pub jitter_ratio: f64,
    pub poisson_min_interval: f64,
    pub poisson_max_interval: f64,
    /// Poisson arrivals per minute per device; unset derives the rate from
    /// `message_interval`.
    pub poisson_rate_per_minute: Option<f64>,
    pub burst: Option<BurstConfig>,
    pub latency_sample_cap: usize,
    pub shutdown_grace_period: f64,
    pub max_messages_per_device: Option<u64>,
    /// Seconds between progress snapshots, 0 disables them.
    pub report_interval: f64,
    pub partial_provisioning: PartialPolicy,
    pub validate_devices: bool,
    pub registration_concurrency: usize,
    pub registration_throttle: Option<ThrottleConfig>,
    pub message_type: MessageType,
    pub seed: Option<u64>,
    pub sla: SlaThresholds,
    pub report_dir: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
    pub adapters: AdapterConfig,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            tenants: 5,
            devices: 10,
            protocols: vec![Protocol::Mqtt],
            message_interval: 10.0,
            duration: None,
            jitter_mode: JitterMode::Fixed,
            jitter_ratio: 0.2,
            poisson_min_interval: 0.1,
            poisson_max_interval: 300.0,
            poisson_rate_per_minute: None,
            burst: None,
            latency_sample_cap: 10_000,
            shutdown_grace_period: 5.0,
            max_messages_per_device: None,
            report_interval: 10.0,
            partial_provisioning: PartialPolicy::Proceed,
            validate_devices: true,
            registration_concurrency: 5,
            registration_throttle: None,
            message_type: MessageType::Telemetry,
            seed: None,
            sla: SlaThresholds::default(),
            report_dir: None,
            metrics_addr: None,
            adapters: AdapterConfig::default(),
        }
    }
}

impl LoadConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, LoadError> {
        Self::default().merge_vars(|key| std::env::var(key).ok())
    }

    /// Loads a JSON profile. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: LoadConfig = serde_json::from_reader(reader)?;

        info!("Loaded configuration from {}", path.display());
        config.validated()
    }

    /// Overrides fields from `HONO_*` (and the adapter-specific) variables
    /// returned by `vars`, then validates the result.
    pub fn merge_vars<F>(mut self, vars: F) -> Result<Self, LoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        set(&vars, "HONO_TENANTS", &mut self.tenants)?;
        set(&vars, "HONO_DEVICES", &mut self.devices)?;
        if let Some(raw) = vars("HONO_PROTOCOLS") {
            self.protocols = parse_protocols(&raw)?;
        }
        set(&vars, "HONO_MESSAGE_INTERVAL", &mut self.message_interval)?;
        if let Some(raw) = vars("HONO_DURATION") {
            self.duration = match raw.trim() {
                "" | "0" | "none" => None,
                value => Some(parse("HONO_DURATION", value)?),
            };
        }
        set(&vars, "HONO_JITTER_MODE", &mut self.jitter_mode)?;
        set(&vars, "HONO_JITTER_RATIO", &mut self.jitter_ratio)?;
        set(&vars, "HONO_POISSON_MIN_INTERVAL", &mut self.poisson_min_interval)?;
        set(&vars, "HONO_POISSON_MAX_INTERVAL", &mut self.poisson_max_interval)?;
        set_opt(&vars, "HONO_POISSON_RATE", &mut self.poisson_rate_per_minute)?;
        set(&vars, "HONO_LATENCY_SAMPLE_CAP", &mut self.latency_sample_cap)?;
        set(&vars, "HONO_SHUTDOWN_GRACE_PERIOD", &mut self.shutdown_grace_period)?;
        set_opt(&vars, "HONO_MAX_MESSAGES", &mut self.max_messages_per_device)?;
        set(&vars, "HONO_REPORT_INTERVAL", &mut self.report_interval)?;
        set(&vars, "HONO_PARTIAL_PROVISIONING", &mut self.partial_provisioning)?;
        set_flag(&vars, "HONO_VALIDATE", &mut self.validate_devices);
        set(&vars, "HONO_REGISTRATION_CONCURRENCY", &mut self.registration_concurrency)?;
        if let Some(raw) = vars("HONO_THROTTLE_BASE_DELAY") {
            let throttle = self
                .registration_throttle
                .get_or_insert_with(ThrottleConfig::default);
            throttle.base_delay_secs = parse("HONO_THROTTLE_BASE_DELAY", &raw)?;
        }
        if let Some(throttle) = self.registration_throttle.as_mut() {
            set(&vars, "HONO_THROTTLE_JITTER", &mut throttle.jitter_secs)?;
        }
        set(&vars, "HONO_MESSAGE_TYPE", &mut self.message_type)?;
        set_opt(&vars, "HONO_SEED", &mut self.seed)?;
        set_opt(&vars, "HONO_REPORT_DIR", &mut self.report_dir)?;
        set_opt(&vars, "HONO_METRICS_ADDR", &mut self.metrics_addr)?;

        if let Some(raw) = vars("HONO_BURST_MULTIPLIER") {
            let burst = self.burst.get_or_insert_with(BurstConfig::default);
            burst.multiplier = parse("HONO_BURST_MULTIPLIER", &raw)?;
        }
        if let Some(burst) = self.burst.as_mut() {
            set(&vars, "HONO_BURST_DURATION", &mut burst.duration_secs)?;
            set(&vars, "HONO_BURST_FREQUENCY", &mut burst.frequency_secs)?;
        }

        set(&vars, "HONO_SLA_P95_MS", &mut self.sla.p95_latency_ms)?;
        set(&vars, "HONO_SLA_P99_MS", &mut self.sla.p99_latency_ms)?;
        set(&vars, "HONO_SLA_SUCCESS_RATE", &mut self.sla.success_rate_percent)?;

        let adapters = &mut self.adapters;
        set(&vars, "REGISTRY_IP", &mut adapters.registry_host)?;
        set(&vars, "REGISTRY_PORT", &mut adapters.registry_port)?;
        set(&vars, "REGISTRY_USERNAME", &mut adapters.registry_username)?;
        set(&vars, "REGISTRY_PASSWORD", &mut adapters.registry_password)?;
        set(&vars, "HTTP_ADAPTER_IP", &mut adapters.http_adapter_host)?;
        set(&vars, "HTTP_ADAPTER_PORT", &mut adapters.http_adapter_port)?;
        set(&vars, "MQTT_ADAPTER_IP", &mut adapters.mqtt_host)?;
        set(&vars, "MQTT_ADAPTER_PORT", &mut adapters.mqtt_port)?;
        if vars("USE_TLS").is_some() {
            set_flag(&vars, "USE_TLS", &mut adapters.use_tls);
            // MQTT follows USE_TLS unless it is set on its own.
            adapters.mqtt_tls = adapters.use_tls;
        }
        set_flag(&vars, "USE_MQTT_TLS", &mut adapters.mqtt_tls);
        set_flag(&vars, "VERIFY_SSL", &mut adapters.verify_tls);
        set_opt(&vars, "CA_FILE_PATH", &mut adapters.ca_file)?;
        set(&vars, "HTTP_TIMEOUT", &mut adapters.request_timeout_secs)?;
        set(&vars, "MQTT_CONNECT_TIMEOUT", &mut adapters.mqtt_connect_timeout_secs)?;
        set(&vars, "MQTT_KEEPALIVE", &mut adapters.mqtt_keepalive_secs)?;

        self.validated()
    }

    /// Checks ranges and removes duplicate protocols, keeping their order.
    pub fn validated(mut self) -> Result<Self, LoadError> {
        let mut protocols = Vec::with_capacity(self.protocols.len());
        for protocol in self.protocols.drain(..) {
            if !protocols.contains(&protocol) {
                protocols.push(protocol);
            }
        }
        self.protocols = protocols;

        if self.protocols.is_empty() {
            return Err(LoadError::Config("at least one protocol is required".into()));
        }
        positive("message_interval", self.message_interval)?;
        seconds("message_interval", self.message_interval * (1.0 + self.jitter_ratio.max(0.0)))?;
        if let Some(duration) = self.duration {
            positive("duration", duration)?;
            seconds("duration", duration)?;
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(LoadError::Config(format!(
                "jitter_ratio must be in [0, 1), got {}",
                self.jitter_ratio
            )));
        }
        positive("poisson_min_interval", self.poisson_min_interval)?;
        seconds("poisson_max_interval", self.poisson_max_interval)?;
        if !(self.poisson_max_interval >= self.poisson_min_interval) {
            return Err(LoadError::Config(
                "poisson_max_interval must not be below poisson_min_interval".into(),
            ));
        }
        if let Some(rate) = self.poisson_rate_per_minute {
            positive("poisson_rate_per_minute", rate)?;
            seconds("poisson_rate_per_minute", 60.0 / rate)?;
        }
        if let Some(burst) = &self.burst {
            positive("burst.multiplier", burst.multiplier)?;
            seconds("burst.duration_secs", burst.duration_secs)?;
            seconds("burst.frequency_secs", burst.frequency_secs)?;
            seconds(
                "message_interval / burst.multiplier",
                self.message_interval / burst.multiplier,
            )?;
            seconds(
                "burst.duration_secs + burst.frequency_secs",
                burst.duration_secs + burst.frequency_secs,
            )?;
        }
        if let Some(throttle) = &self.registration_throttle {
            seconds("registration_throttle.base_delay_secs", throttle.base_delay_secs)?;
            seconds(
                "registration_throttle.jitter_secs",
                throttle.base_delay_secs + throttle.jitter_secs + 0.5,
            )?;
        }
        if self.latency_sample_cap == 0 {
            return Err(LoadError::Config("latency_sample_cap must be positive".into()));
        }
        seconds("shutdown_grace_period", self.shutdown_grace_period)?;
        seconds("report_interval", self.report_interval)?;
        if self.registration_concurrency == 0 {
            return Err(LoadError::Config(
                "registration_concurrency must be positive".into(),
            ));
        }
        positive("request_timeout_secs", self.adapters.request_timeout_secs)?;
        seconds("request_timeout_secs", self.adapters.request_timeout_secs)?;
        positive(
            "mqtt_connect_timeout_secs",
            self.adapters.mqtt_connect_timeout_secs,
        )?;
        seconds(
            "mqtt_connect_timeout_secs",
            self.adapters.mqtt_connect_timeout_secs,
        )?;
        if self.adapters.mqtt_keepalive_secs == 0 {
            return Err(LoadError::Config("mqtt_keepalive_secs must be positive".into()));
        }

        Ok(self)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.message_interval)
    }

    pub fn duration_limit(&self) -> Option<Duration> {
        self.duration.map(Duration::from_secs_f64)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_period)
    }

    pub fn report_every(&self) -> Option<Duration> {
        if self.report_interval > 0.0 {
            Some(Duration::from_secs_f64(self.report_interval))
        } else {
            None
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        match self.jitter_mode {
            JitterMode::Fixed => WaitPolicy::Fixed,
            JitterMode::Uniform => WaitPolicy::Uniform {
                ratio: self.jitter_ratio,
            },
            JitterMode::Poisson => WaitPolicy::Poisson {
                mean: self
                    .poisson_rate_per_minute
                    .map(|rate| Duration::from_secs_f64(60.0 / rate)),
                min: Duration::from_secs_f64(self.poisson_min_interval),
                max: Duration::from_secs_f64(self.poisson_max_interval),
            },
        }
    }

    pub fn schedule(&self) -> Schedule {
        Schedule {
            interval: self.interval(),
            policy: self.wait_policy(),
            burst: self.burst.as_ref().map(|burst| BurstSchedule {
                multiplier: burst.multiplier,
                duration: Duration::from_secs_f64(burst.duration_secs),
                frequency: Duration::from_secs_f64(burst.frequency_secs),
            }),
        }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, LoadError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| LoadError::Config(format!("{}={:?}: {}", key, raw, e)))
}

fn set<T, F>(vars: &F, key: &str, field: &mut T) -> Result<(), LoadError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = vars(key) {
        *field = parse(key, &raw)?;
    }

    Ok(())
}

fn set_opt<T, F>(vars: &F, key: &str, field: &mut Option<T>) -> Result<(), LoadError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = vars(key) {
        *field = if raw.trim().is_empty() {
            None
        } else {
            Some(parse(key, &raw)?)
        };
    }

    Ok(())
}

fn set_flag<F>(vars: &F, key: &str, field: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = vars(key) {
        *field = matches!(
            raw.trim().to_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        );
    }
}

fn parse_protocols(raw: &str) -> Result<Vec<Protocol>, LoadError> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

fn positive(name: &str, value: f64) -> Result<(), LoadError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LoadError::Config(format!("{} must be positive, got {}", name, value)))
    }
}

/// Non-negative and small enough to become a `Duration`.
fn seconds(name: &str, value: f64) -> Result<(), LoadError> {
    non_negative(name, value)?;
    Duration::try_from_secs_f64(value)
        .map(|_| ())
        .map_err(|e| LoadError::Config(format!("{} is out of range ({}): {}", name, value, e)))
}

fn non_negative(name: &str, value: f64) -> Result<(), LoadError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(LoadError::Config(format!(
            "{} must not be negative, got {}",
            name, value
        )))
    }
}
