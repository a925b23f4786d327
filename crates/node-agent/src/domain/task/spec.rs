//! Parsing of the free-form `server_specification` blob attached to every task.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Deserializer;

use crate::domain::resource::GpuRequest;
use crate::domain::resource::PoolError;

/// Env var naming the GPUs a workload should see
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecError {
    #[error("server specification is not valid JSON: {0}")]
    Syntax(String),
    #[error("invalid GPU request in server specification: {0}")]
    Gpu(#[from] PoolError),
    #[error("unknown operation `{0}` in server specification")]
    UnknownOperation(String),
}

/// What the task asks the state machine to do with its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Directive {
    /// Create (when needed) and start a fresh instance
    #[default]
    Start,
    /// Stop and start the existing instance
    Restart,
    /// Rebuild the running instance from a committed artifact, possibly with new GPUs
    Update,
}

/// Parsed view of a task's server specification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerSpecification {
    pub gpus: GpuRequest,
    /// Extra environment for the workload, without the visible-devices entry
    pub env: BTreeMap<String, String>,
    /// Container port to host port
    pub ports: BTreeMap<String, String>,
    /// Memory limit as understood by the backend, e.g. `8g`
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub cpu_shares: Option<u64>,
    pub directive: Directive,
    /// Sleep budget for the update flow, seconds
    pub sleep_time: Option<u64>,
}

impl ServerSpecification {
    /// Parses the raw blob. An empty blob is a plain start with no GPUs and the bare word
    /// `restart` is the restart directive.
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        if raw == "restart" {
            return Ok(Self {
                directive: Directive::Restart,
                ..Self::default()
            });
        }

        let parsed: RawSpec =
            serde_json::from_str(raw).map_err(|e| SpecError::Syntax(e.to_string()))?;

        let mut env = parsed.env;
        let gpus = match (env.remove(VISIBLE_DEVICES_ENV), parsed.gpu_count) {
            (Some(devices), _) => devices.parse::<GpuRequest>()?,
            (None, Some(count)) => GpuRequest::Count(count),
            (None, None) => GpuRequest::None,
        };

        let directive = match parsed.operation.as_deref().map(str::trim) {
            None | Some("") | Some("start") | Some("create") => Directive::Start,
            Some("restart") => Directive::Restart,
            Some("update") | Some("change_gpu") => Directive::Update,
            Some(other) => return Err(SpecError::UnknownOperation(other.to_string())),
        };

        Ok(Self {
            gpus,
            env,
            ports: parsed.port,
            memory: parsed.memory,
            memory_swap: parsed.memory_swap,
            cpu_shares: parsed.cpu_shares,
            directive,
            sleep_time: parsed.sleep_time,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSpec {
    #[serde(deserialize_with = "string_map")]
    env: BTreeMap<String, String>,
    #[serde(deserialize_with = "string_map")]
    port: BTreeMap<String, String>,
    #[serde(deserialize_with = "optional_number_from_string")]
    gpu_count: Option<usize>,
    #[serde(deserialize_with = "optional_string_from_number")]
    memory: Option<String>,
    #[serde(deserialize_with = "optional_string_from_number")]
    memory_swap: Option<String>,
    #[serde(deserialize_with = "optional_number_from_string")]
    cpu_shares: Option<u64>,
    operation: Option<String>,
    #[serde(deserialize_with = "optional_number_from_string")]
    sleep_time: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

/// Accepts both `"10"` and `10`, the upstream emits either.
fn optional_number_from_string<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(value) => {
            let s = value.into_string();
            if s.trim().is_empty() {
                return Ok(None);
            }
            s.trim().parse::<T>().map(Some).map_err(|e| {
                serde::de::Error::custom(format!("Failed to parse integer from '{s}': {e}"))
            })
        }
    }
}

fn optional_string_from_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?
        .map(StringOrNumber::into_string)
        .filter(|s| !s.is_empty()))
}

fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = Option::<BTreeMap<String, StringOrNumber>>::deserialize(deserializer)?;
    Ok(map
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect())
}
