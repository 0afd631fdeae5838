use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::commands::driver::LoopPolicy;
use crate::service::Behavior;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Simulated time each step of a request takes
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// Objects seeded into the first group, by type
    #[serde(default)]
    pub objects: BTreeMap<String, Vec<i64>>, // normalized

    #[serde(default)]
    pub behavior: Behavior,
}

fn default_step_delay_ms() -> u64 {
    100
}
fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: default_step_delay_ms(),
            groups: default_groups(),
            objects: BTreeMap::new(),
            behavior: Behavior::default(),
        }
    }
}

impl ServiceConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub loop_policy: LoopPolicy,
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Parse the compact `"/Image:1,/Image:2,/Dataset:5"` form of `objects`.
fn parse_objects(s: &str) -> Result<BTreeMap<String, Vec<i64>>> {
    let mut objects: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        let (target_type, id) = item
            .rsplit_once(':')
            .with_context(|| format!("object '{item}' is not TYPE:ID"))?;
        let id = id
            .trim()
            .parse::<i64>()
            .with_context(|| format!("object '{item}' has a non-numeric id"))?;
        objects.entry(target_type.trim().to_string()).or_default().push(id);
    }
    Ok(objects)
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: serde_json::Value = serde_json::from_str(&raw).context("parsing JSON")?;
        let compact = cfg
            .pointer("/service/objects")
            .and_then(|v| v.as_str())
            .map(parse_objects)
            .transpose()?;
        if let Some(objects) = compact {
            cfg["service"]["objects"] =
                serde_json::to_value(objects).context("normalizing objects")?;
        }
        let typed: Config = serde_json::from_value(cfg).context("mapping to Config")?;
        Ok(typed)
    }
}
