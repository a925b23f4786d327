//! In-memory GPU allocation ledger.
//!
//! The pool tracks every physical device by index together with the task that currently
//! owns it. All binding goes through [`GpuPool::allocate`] or [`GpuPool::bind`], both of which
//! are all-or-nothing. Releasing is idempotent.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

/// Set of GPU indices, ordered so that textual forms are deterministic
pub type DeviceSet = BTreeSet<u32>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("invalid gpu id `{0}`")]
    InvalidDeviceId(String),
    #[error("invalid gpu count `{0}`")]
    InvalidCount(String),
}

/// What a task asks the pool for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GpuRequest {
    /// No GPU at all
    #[default]
    None,
    /// Every device on the node
    All,
    /// Exactly these indices
    Devices(DeviceSet),
    /// Any `n` free devices, lowest indices first
    Count(usize),
}

impl GpuRequest {
    pub fn is_none(&self) -> bool {
        matches!(self, GpuRequest::None)
            || matches!(self, GpuRequest::Devices(set) if set.is_empty())
            || matches!(self, GpuRequest::Count(0))
    }
}

impl FromStr for GpuRequest {
    type Err = PoolError;

    /// Accepts `none`, an empty string, `all`, `count:N` or a comma separated id list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(GpuRequest::None);
        }
        if s.eq_ignore_ascii_case("all") {
            return Ok(GpuRequest::All);
        }
        if let Some(count) = s.strip_prefix("count:") {
            let n = count
                .trim()
                .parse::<usize>()
                .map_err(|_| PoolError::InvalidCount(count.to_string()))?;
            return Ok(GpuRequest::Count(n));
        }

        let mut ids = DeviceSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let id = part
                .parse::<u32>()
                .map_err(|_| PoolError::InvalidDeviceId(part.to_string()))?;
            ids.insert(id);
        }
        Ok(GpuRequest::Devices(ids))
    }
}

impl fmt::Display for GpuRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuRequest::None => f.write_str("none"),
            GpuRequest::All => f.write_str("all"),
            GpuRequest::Count(n) => write!(f, "count:{n}"),
            GpuRequest::Devices(ids) => f.write_str(&join_ids(ids)),
        }
    }
}

/// Renders a device set as `0,1,3`.
pub fn join_ids(ids: &DeviceSet) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GpuDevice {
    model: String,
    owner: Option<String>,
}

/// Read-only view of a device for diagnostics and the API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceView {
    pub id: u32,
    pub model: String,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuPool {
    devices: BTreeMap<u32, GpuDevice>,
}

impl GpuPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool of free devices from `(index, model)` pairs.
    pub fn from_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let devices = devices
            .into_iter()
            .map(|(id, model)| {
                (
                    id,
                    GpuDevice {
                        model: model.into(),
                        owner: None,
                    },
                )
            })
            .collect();
        Self { devices }
    }

    pub fn total(&self) -> usize {
        self.devices.len()
    }

    pub fn free_count(&self) -> usize {
        self.devices.values().filter(|d| d.owner.is_none()).count()
    }

    pub fn allocated_count(&self) -> usize {
        self.total() - self.free_count()
    }

    pub fn owner_of(&self, id: u32) -> Option<&str> {
        self.devices.get(&id).and_then(|d| d.owner.as_deref())
    }

    /// Devices currently held by `owner`.
    pub fn held_by(&self, owner: &str) -> DeviceSet {
        self.devices
            .iter()
            .filter(|(_, d)| d.owner.as_deref() == Some(owner))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Read-only fit test against currently free devices.
    pub fn check(&self, request: &GpuRequest) -> bool {
        self.select(request).is_some()
    }

    /// Concrete free devices that would satisfy `request`, without binding them.
    pub fn select(&self, request: &GpuRequest) -> Option<DeviceSet> {
        self.resolve(request, None)
    }

    /// Like [`GpuPool::select`], counting devices already held by `owner` as available.
    pub fn select_for(&self, request: &GpuRequest, owner: &str) -> Option<DeviceSet> {
        self.resolve(request, Some(owner))
    }

    /// Binds the devices satisfying `request` to `owner`.
    ///
    /// Returns the bound set, or `None` without touching the ledger if any requested
    /// device is missing or held by someone else. Devices already held by `owner` count as
    /// available, so repeating an identical allocation is a no-op.
    pub fn allocate(&mut self, request: &GpuRequest, owner: &str) -> Option<DeviceSet> {
        let ids = self.resolve(request, Some(owner))?;
        for id in &ids {
            if let Some(device) = self.devices.get_mut(id) {
                device.owner = Some(owner.to_string());
            }
        }
        Some(ids)
    }

    /// Replays an exact, previously resolved allocation.
    pub fn bind(&mut self, ids: &DeviceSet, owner: &str) -> bool {
        self.allocate(&GpuRequest::Devices(ids.clone()), owner)
            .is_some()
    }

    /// Releases the given devices. Unknown or already free ids are ignored.
    pub fn free(&mut self, ids: &DeviceSet) {
        for id in ids {
            if let Some(device) = self.devices.get_mut(id) {
                device.owner = None;
            }
        }
    }

    /// Reconciles a freshly probed inventory into the ledger.
    ///
    /// New devices join as free and models are refreshed. A device that disappeared is
    /// dropped only while free; a bound one stays until its owner releases it.
    pub fn merge(&mut self, probed: &GpuPool) {
        for (id, device) in &probed.devices {
            match self.devices.get_mut(id) {
                Some(existing) => existing.model.clone_from(&device.model),
                None => {
                    info!(gpu_id = id, model = %device.model, "GPU discovered");
                    self.devices.insert(
                        *id,
                        GpuDevice {
                            model: device.model.clone(),
                            owner: None,
                        },
                    );
                }
            }
        }

        self.devices.retain(|id, device| {
            if probed.devices.contains_key(id) {
                return true;
            }
            match &device.owner {
                None => {
                    info!(gpu_id = id, "GPU vanished, removing from pool");
                    false
                }
                Some(owner) => {
                    warn!(gpu_id = id, task_id = %owner, "Bound GPU vanished from probe");
                    true
                }
            }
        });
    }

    pub fn devices(&self) -> Vec<DeviceView> {
        self.devices
            .iter()
            .map(|(id, d)| DeviceView {
                id: *id,
                model: d.model.clone(),
                owner: d.owner.clone(),
            })
            .collect()
    }

    fn is_available(device: &GpuDevice, owner: Option<&str>) -> bool {
        match (&device.owner, owner) {
            (None, _) => true,
            (Some(held), Some(owner)) => held == owner,
            (Some(_), None) => false,
        }
    }

    fn resolve(&self, request: &GpuRequest, owner: Option<&str>) -> Option<DeviceSet> {
        match request {
            GpuRequest::None => Some(DeviceSet::new()),
            GpuRequest::All => {
                if self.devices.values().all(|d| Self::is_available(d, owner)) {
                    Some(self.devices.keys().copied().collect())
                } else {
                    None
                }
            }
            GpuRequest::Devices(ids) => {
                let fits = ids.iter().all(|id| {
                    self.devices
                        .get(id)
                        .is_some_and(|d| Self::is_available(d, owner))
                });
                fits.then(|| ids.clone())
            }
            GpuRequest::Count(n) => {
                // Devices already held by the owner come first so a repeat is stable.
                let mut held: Vec<u32> = match owner {
                    Some(owner) => self.held_by(owner).into_iter().collect(),
                    None => Vec::new(),
                };
                let free = self
                    .devices
                    .iter()
                    .filter(|(_, d)| d.owner.is_none())
                    .map(|(id, _)| *id);
                held.extend(free);
                (held.len() >= *n).then(|| held.into_iter().take(*n).collect())
            }
        }
    }
}

#[derive(Serialize)]
struct GpuEntry<'a> {
    id: String,
    state: &'a str,
}

#[derive(Serialize)]
struct PoolSnapshot<'a> {
    gpus: Vec<GpuEntry<'a>>,
}

impl fmt::Display for GpuPool {
    /// Renders `{"gpus":[{"id":"0","state":"idle"},...]}` in index order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = PoolSnapshot {
            gpus: self
                .devices
                .iter()
                .map(|(id, d)| GpuEntry {
                    id: id.to_string(),
                    state: if d.owner.is_some() { "busy" } else { "idle" },
                })
                .collect(),
        };
        let text = serde_json::to_string(&snapshot).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn pool(n: u32) -> GpuPool {
        GpuPool::from_devices((0..n).map(|i| (i, "NVIDIA A100")))
    }

    fn ids(list: &[u32]) -> DeviceSet {
        list.iter().copied().collect()
    }

    #[test]
    fn parse_request_forms() {
        assert_eq!("none".parse::<GpuRequest>(), Ok(GpuRequest::None));
        assert_eq!("".parse::<GpuRequest>(), Ok(GpuRequest::None));
        assert_eq!("ALL".parse::<GpuRequest>(), Ok(GpuRequest::All));
        assert_eq!(
            "2, 0,1".parse::<GpuRequest>(),
            Ok(GpuRequest::Devices(ids(&[0, 1, 2])))
        );
        assert_eq!("count:3".parse::<GpuRequest>(), Ok(GpuRequest::Count(3)));
        assert_eq!(
            "0,x".parse::<GpuRequest>(),
            Err(PoolError::InvalidDeviceId("x".to_string()))
        );
        assert_eq!(
            "count:many".parse::<GpuRequest>(),
            Err(PoolError::InvalidCount("many".to_string()))
        );
    }

    #[test]
    fn snapshot_format_is_deterministic() {
        let mut pool = pool(2);
        pool.allocate(&GpuRequest::Devices(ids(&[1])), "t1");
        assert_eq!(
            pool.to_string(),
            r#"{"gpus":[{"id":"0","state":"idle"},{"id":"1","state":"busy"}]}"#
        );
    }

    #[test]
    fn allocate_is_all_or_nothing() {
        let mut pool = pool(4);
        assert!(pool.allocate(&GpuRequest::Devices(ids(&[0, 1])), "t1").is_some());
        let before = pool.to_string();

        assert_eq!(pool.allocate(&GpuRequest::Devices(ids(&[1, 2])), "t2"), None);
        assert_eq!(pool.to_string(), before);
        assert_eq!(pool.owner_of(2), None);

        assert_eq!(pool.allocate(&GpuRequest::Devices(ids(&[7])), "t2"), None);
        assert_eq!(pool.to_string(), before);
    }

    #[test]
    fn count_request_takes_lowest_free_ids() {
        let mut pool = pool(4);
        pool.allocate(&GpuRequest::Devices(ids(&[0])), "t1");
        let bound = pool.allocate(&GpuRequest::Count(2), "t2");
        assert_eq!(bound, Some(ids(&[1, 2])));
        assert_eq!(pool.allocate(&GpuRequest::Count(2), "t3"), None);
        assert!(pool.check(&GpuRequest::Count(1)));
    }

    #[test]
    fn all_requires_every_device_free() {
        let mut pool = pool(2);
        assert!(pool.check(&GpuRequest::All));
        pool.allocate(&GpuRequest::Devices(ids(&[0])), "t1");
        assert!(!pool.check(&GpuRequest::All));
    }

    #[test]
    fn free_restores_prior_snapshot_and_is_idempotent() {
        let mut pool = pool(4);
        let before = pool.to_string();

        let bound = pool
            .allocate(&GpuRequest::Count(2), "t1")
            .expect("should allocate");
        assert_eq!(pool.free_count(), 2);

        pool.free(&bound);
        assert_eq!(pool.to_string(), before);
        let once = pool.to_string();
        pool.free(&bound);
        assert_eq!(pool.to_string(), once);
    }

    #[test]
    fn repeated_identical_allocation_is_a_noop() {
        let mut pool = pool(4);
        let first = pool.allocate(&GpuRequest::Count(2), "t1");
        let snapshot = pool.to_string();
        let second = pool.allocate(&GpuRequest::Count(2), "t1");
        assert_eq!(first, second);
        assert_eq!(pool.to_string(), snapshot);
    }

    #[test]
    fn allocations_never_exceed_capacity() {
        let mut pool = pool(4);
        let mut held = Vec::new();
        for (i, n) in [1usize, 3, 2, 1, 4, 1].iter().enumerate() {
            if let Some(set) = pool.allocate(&GpuRequest::Count(*n), &format!("t{i}")) {
                held.push(set);
            }
            assert!(pool.allocated_count() <= pool.total());
            if i % 2 == 1 {
                if let Some(set) = held.pop() {
                    pool.free(&set);
                }
            }
        }
        let bound: usize = held.iter().map(BTreeSet::len).sum();
        assert_eq!(bound, pool.allocated_count());
    }

    #[test]
    fn merge_keeps_allocations_and_adds_new_devices() {
        let mut pool = pool(2);
        pool.allocate(&GpuRequest::Devices(ids(&[1])), "t1");

        let probed = GpuPool::from_devices([(0, "NVIDIA H100"), (2, "NVIDIA H100")]);
        pool.merge(&probed);

        assert_eq!(pool.total(), 3);
        assert_eq!(pool.owner_of(1), Some("t1"));
        assert_eq!(pool.owner_of(2), None);
        assert_eq!(pool.devices()[0].model, "NVIDIA H100");

        pool.free(&ids(&[1]));
        pool.merge(&probed);
        assert_eq!(pool.total(), 2);
    }
}
