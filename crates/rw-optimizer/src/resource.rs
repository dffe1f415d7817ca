//! Compute resource discovery.
//!
//! The selector claims one resource whose free capacity meets a threshold and
//! keeps it for the rest of the process. There is no cross-process locking:
//! two processes polling the same fleet can pick the same device.

use rw_types::ResourceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

/// Snapshot of one compute resource as reported by a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub index: usize,
    pub free_mb: u64,
}

/// A claimed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub index: usize,
    pub kind: ResourceKind,
    pub free_mb_at_claim: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Gpu,
    Cpu,
}

impl ResourceHandle {
    /// Environment a training process needs to see only this resource.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        match self.kind {
            ResourceKind::Gpu => {
                vars.insert("CUDA_VISIBLE_DEVICES".to_string(), self.index.to_string());
            }
            ResourceKind::Cpu => {
                vars.insert("CUDA_VISIBLE_DEVICES".to_string(), String::new());
            }
        }
        vars
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ResourceKind::Gpu => write!(f, "gpu:{}", self.index),
            ResourceKind::Cpu => write!(f, "cpu:{}", self.index),
        }
    }
}

/// Anything that can list resources and their free capacity.
pub trait ResourceProbe: Send {
    fn kind(&self) -> ResourceKind;

    fn poll(&mut self) -> Result<Vec<ResourceInfo>, ResourceError>;
}

/// Queries `nvidia-smi` for per-GPU free memory.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    program: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Parse `--query-gpu=index,memory.free --format=csv,noheader,nounits`.
    pub fn parse(output: &str) -> Result<Vec<ResourceInfo>, ResourceError> {
        let mut resources = Vec::new();
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut fields = line.split(',').map(str::trim);
            let (Some(index), Some(free)) = (fields.next(), fields.next()) else {
                return Err(ResourceError::Probe {
                    message: format!("unexpected nvidia-smi line: {line}"),
                });
            };
            let index = index.parse().map_err(|_| ResourceError::Probe {
                message: format!("bad GPU index in line: {line}"),
            })?;
            let free_mb = free.parse().map_err(|_| ResourceError::Probe {
                message: format!("bad free memory in line: {line}"),
            })?;
            resources.push(ResourceInfo { index, free_mb });
        }
        Ok(resources)
    }
}

impl ResourceProbe for NvidiaSmiProbe {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Gpu
    }

    fn poll(&mut self) -> Result<Vec<ResourceInfo>, ResourceError> {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=index,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| ResourceError::Probe {
                message: format!("failed to run {}: {e}", self.program),
            })?;
        if !output.status.success() {
            return Err(ResourceError::Probe {
                message: format!("{} exited with {}", self.program, output.status),
            });
        }
        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Fixed resource list; `StaticProbe::cpu()` stands in for GPU-less runs.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    kind: ResourceKind,
    resources: Vec<ResourceInfo>,
}

impl StaticProbe {
    pub fn new(kind: ResourceKind, resources: Vec<ResourceInfo>) -> Self {
        Self { kind, resources }
    }

    pub fn cpu() -> Self {
        Self::new(
            ResourceKind::Cpu,
            vec![ResourceInfo {
                index: 0,
                free_mb: u64::MAX,
            }],
        )
    }
}

impl ResourceProbe for StaticProbe {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn poll(&mut self) -> Result<Vec<ResourceInfo>, ResourceError> {
        Ok(self.resources.clone())
    }
}

/// Polling and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Minimum free capacity (MB) a resource must report.
    pub required_free_mb: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            required_free_mb: 0,
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

pub struct ResourceSelector {
    probe: Box<dyn ResourceProbe>,
    config: ResourceConfig,
    claimed: Option<ResourceHandle>,
}

impl ResourceSelector {
    pub fn new(probe: Box<dyn ResourceProbe>, config: ResourceConfig) -> Self {
        Self {
            probe,
            config,
            claimed: None,
        }
    }

    pub fn claimed(&self) -> Option<&ResourceHandle> {
        self.claimed.as_ref()
    }

    /// Return the claimed resource, polling for one first if nothing is held.
    pub fn acquire(&mut self) -> Result<ResourceHandle, ResourceError> {
        if let Some(handle) = &self.claimed {
            return Ok(handle.clone());
        }

        let attempts = self.config.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);

        for attempt in 1..=attempts {
            match self.probe.poll() {
                Ok(resources) => {
                    let free = resources
                        .iter()
                        .filter(|r| r.free_mb >= self.config.required_free_mb)
                        .min_by_key(|r| r.index);
                    if let Some(info) = free {
                        let handle = ResourceHandle {
                            index: info.index,
                            kind: self.probe.kind(),
                            free_mb_at_claim: info.free_mb,
                        };
                        tracing::info!(resource = %handle, free_mb = info.free_mb, "claimed resource");
                        self.claimed = Some(handle.clone());
                        return Ok(handle);
                    }
                    tracing::warn!(
                        attempt,
                        attempts,
                        required_free_mb = self.config.required_free_mb,
                        seen = resources.len(),
                        "no resource with enough free capacity"
                    );
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "resource probe failed");
                }
            }

            if attempt < attempts {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        Err(ResourceError::NoResourceAvailable {
            attempts,
            required_free_mb: self.config.required_free_mb,
        })
    }
}
