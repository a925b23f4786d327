//! GPU inventory discovery
//!
//! NVML is queried first; when the driver library is unavailable the procfs files
//! exported by the NVIDIA kernel module are read instead.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use nvml_wrapper::Nvml;
use tracing::debug;
use tracing::warn;

use crate::domain::resource::GpuPool;

pub const PROC_GPU_PATTERN: &str = "/proc/driver/nvidia/gpus/*/information";

/// PCI location of a device, as used for VM passthrough
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = anyhow::Error;

    /// Accepts `dddd:bb:ss.f` with a domain of any width, e.g. NVML's `00000000:3B:00.0`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (domain, rest) = s
            .split_once(':')
            .with_context(|| format!("invalid PCI address `{s}`"))?;
        let (bus, rest) = rest
            .split_once(':')
            .with_context(|| format!("invalid PCI address `{s}`"))?;
        let (slot, function) = rest
            .split_once('.')
            .with_context(|| format!("invalid PCI address `{s}`"))?;

        Ok(Self {
            domain: u32::from_str_radix(domain, 16)
                .with_context(|| format!("invalid PCI domain in `{s}`"))?,
            bus: u8::from_str_radix(bus, 16).with_context(|| format!("invalid PCI bus in `{s}`"))?,
            slot: u8::from_str_radix(slot, 16)
                .with_context(|| format!("invalid PCI slot in `{s}`"))?,
            function: u8::from_str_radix(function, 16)
                .with_context(|| format!("invalid PCI function in `{s}`"))?,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedGpu {
    pub index: u32,
    pub model: String,
    pub pci: Option<PciAddress>,
}

/// Builds a free pool from a probe result.
pub fn to_pool(gpus: &[ProbedGpu]) -> GpuPool {
    GpuPool::from_devices(gpus.iter().map(|g| (g.index, g.model.clone())))
}

/// Index to PCI address map for devices whose location is known.
pub fn pci_map(gpus: &[ProbedGpu]) -> BTreeMap<u32, PciAddress> {
    gpus.iter()
        .filter_map(|g| g.pci.map(|pci| (g.index, pci)))
        .collect()
}

/// Probe local GPUs. An empty result is valid on hosts without NVIDIA devices.
pub fn probe() -> Vec<ProbedGpu> {
    match probe_nvml() {
        Ok(gpus) => gpus,
        Err(e) => {
            debug!(error = %e, "NVML unavailable, falling back to procfs");
            match probe_procfs(PROC_GPU_PATTERN) {
                Ok(gpus) => gpus,
                Err(e) => {
                    warn!(error = %e, "GPU probe failed");
                    Vec::new()
                }
            }
        }
    }
}

fn probe_nvml() -> Result<Vec<ProbedGpu>> {
    let nvml = Nvml::init().context("Failed to initialize NVML")?;
    let mut gpus = Vec::new();
    for index in 0..nvml.device_count()? {
        let device = nvml.device_by_index(index)?;
        let model = device.name()?;
        let pci = device
            .pci_info()
            .ok()
            .and_then(|info| info.bus_id.parse::<PciAddress>().ok());
        gpus.push(ProbedGpu { index, model, pci });
    }
    Ok(gpus)
}

/// Reads every `information` file matched by `pattern`. Devices are indexed in bus order.
pub fn probe_procfs(pattern: &str) -> Result<Vec<ProbedGpu>> {
    let paths =
        glob::glob(pattern).with_context(|| format!("Failed to compile glob pattern: {pattern}"))?;

    let mut found = Vec::new();
    for path in paths {
        let path = path.with_context(|| format!("Failed to read glob path for pattern: {pattern}"))?;
        match read_information(&path) {
            Ok(entry) => found.push(entry),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable GPU entry"),
        }
    }
    found.sort_by(|a, b| a.1.cmp(&b.1));

    Ok(found
        .into_iter()
        .zip(0u32..)
        .map(|((model, pci), index)| ProbedGpu { index, model, pci })
        .collect())
}

fn read_information(path: &Path) -> Result<(String, Option<PciAddress>)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_information(&content)
        .with_context(|| format!("No `Model:` line in {}", path.display()))
}

/// Extracts model and bus location from a procfs `information` file.
pub fn parse_information(content: &str) -> Option<(String, Option<PciAddress>)> {
    let mut model = None;
    let mut pci = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Model" => model = Some(value.trim().to_string()),
            "Bus Location" => pci = value.trim().parse::<PciAddress>().ok(),
            _ => {}
        }
    }
    model.map(|m| (m, pci))
}
