//! Virtual machine backend driving `virsh` and `qemu-img`
//!
//! Artifacts are qcow2 base images in `image_dir`. Each instance boots from a
//! copy-on-write overlay named after the instance, and its handle is the domain name.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::info;
use tracing::warn;

use super::command::run_checked;
use super::command::ProcessPull;
use super::gpu_probe::PciAddress;
use crate::domain::scheduling::BackendError;
use crate::domain::scheduling::ExecutionBackend;
use crate::domain::scheduling::InstanceConfig;
use crate::domain::scheduling::InstanceState;
use crate::domain::scheduling::PullHandle;

pub const DEFAULT_MEMORY_KIB: u64 = 8 * 1024 * 1024;
pub const DEFAULT_VCPUS: u64 = 4;
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

pub struct VirshBackend {
    image_dir: PathBuf,
    artifact_base_url: Option<String>,
    command_timeout: Duration,
    gpu_pci: BTreeMap<u32, PciAddress>,
}

impl VirshBackend {
    pub fn new(
        image_dir: impl Into<PathBuf>,
        artifact_base_url: Option<String>,
        command_timeout: Duration,
        gpu_pci: BTreeMap<u32, PciAddress>,
    ) -> Self {
        Self {
            image_dir: image_dir.into(),
            artifact_base_url,
            command_timeout,
            gpu_pci,
        }
    }

    fn virsh(&self, args: &[&str]) -> Result<String, BackendError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run_checked("virsh", &args, self.command_timeout)
    }

    fn artifact_path(&self, name: &str) -> PathBuf {
        self.image_dir.join(name)
    }

    fn overlay_path(&self, instance: &str) -> PathBuf {
        self.image_dir.join("instances").join(format!("{instance}.qcow2"))
    }

    fn definition_path(&self, instance: &str) -> PathBuf {
        self.image_dir.join("instances").join(format!("{instance}.xml"))
    }

    fn is_running(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.virsh(&["domstate", name])? == "running")
    }
}

/// Parses a memory limit like `8g`, `512m` or `1048576k` into KiB.
pub fn parse_memory_kib(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1),
        'm' => (&value[..value.len() - 1], 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024),
        't' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => return value.parse::<u64>().ok().map(|bytes| bytes / 1024),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// One vCPU per 1024 CPU shares, at least one.
pub fn vcpus_for(cpu_shares: Option<u64>) -> u64 {
    cpu_shares.map_or(DEFAULT_VCPUS, |shares| (shares / 1024).max(1))
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Renders the libvirt domain definition for an instance.
pub fn domain_xml(
    config: &InstanceConfig,
    disk: &Path,
    gpu_pci: &BTreeMap<u32, PciAddress>,
) -> Result<String, BackendError> {
    let memory = match &config.memory {
        Some(m) => parse_memory_kib(m).ok_or_else(|| BackendError::CommandFailed {
            command: "define".to_string(),
            message: format!("invalid memory limit `{m}`"),
        })?,
        None => DEFAULT_MEMORY_KIB,
    };
    let vcpus = vcpus_for(config.cpu_shares);

    let mut xml = String::new();
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&config.name));
    let _ = writeln!(xml, "  <memory unit='KiB'>{memory}</memory>");
    let _ = writeln!(xml, "  <currentMemory unit='KiB'>{memory}</currentMemory>");
    let _ = writeln!(xml, "  <vcpu placement='static'>{vcpus}</vcpu>");
    let _ = writeln!(xml, "  <os>\n    <type arch='x86_64'>hvm</type>\n    <boot dev='hd'/>\n  </os>");
    let _ = writeln!(xml, "  <features>\n    <acpi/>\n    <apic/>\n  </features>");
    let _ = writeln!(xml, "  <cpu mode='host-passthrough'/>");
    let _ = writeln!(xml, "  <devices>");
    let _ = writeln!(xml, "    <disk type='file' device='disk'>");
    let _ = writeln!(xml, "      <driver name='qemu' type='qcow2'/>");
    let _ = writeln!(xml, "      <source file='{}'/>", escape(&disk.to_string_lossy()));
    let _ = writeln!(xml, "      <target dev='vda' bus='virtio'/>");
    let _ = writeln!(xml, "    </disk>");
    for id in &config.gpus {
        let pci = gpu_pci.get(id).ok_or_else(|| BackendError::CommandFailed {
            command: "define".to_string(),
            message: format!("no PCI address known for GPU {id}"),
        })?;
        let _ = writeln!(xml, "    <hostdev mode='subsystem' type='pci' managed='yes'>");
        let _ = writeln!(
            xml,
            "      <source>\n        <address domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/>\n      </source>",
            pci.domain, pci.bus, pci.slot, pci.function
        );
        let _ = writeln!(xml, "    </hostdev>");
    }
    let _ = writeln!(xml, "    <interface type='network'>\n      <source network='default'/>\n      <model type='virtio'/>\n    </interface>");
    let _ = writeln!(xml, "    <graphics type='vnc' autoport='yes' listen='0.0.0.0'/>");
    let _ = writeln!(xml, "  </devices>");
    let _ = write!(xml, "</domain>");
    Ok(xml)
}

impl ExecutionBackend for VirshBackend {
    fn create(&self, config: &InstanceConfig) -> Result<String, BackendError> {
        let base = self.artifact_path(&config.image);
        if !base.exists() {
            return Err(BackendError::ImageNotFound(config.image.clone()));
        }
        let overlay = self.overlay_path(&config.name);
        if let Some(parent) = overlay.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let qemu_args = vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            base.to_string_lossy().into_owned(),
            overlay.to_string_lossy().into_owned(),
        ];
        run_checked("qemu-img", &qemu_args, self.command_timeout)?;

        let definition = self.definition_path(&config.name);
        let xml = domain_xml(config, &overlay, &self.gpu_pci)?;
        std::fs::write(&definition, xml)?;
        self.virsh(&["define", &definition.to_string_lossy()])?;

        info!(name = %config.name, image = %config.image, "Domain defined");
        Ok(config.name.clone())
    }

    fn start(&self, handle: &str) -> Result<(), BackendError> {
        self.virsh(&["start", handle]).map(|_| ())
    }

    fn stop(&self, handle: &str, timeout: Duration) -> Result<(), BackendError> {
        if !self.is_running(handle)? {
            return Ok(());
        }
        self.virsh(&["shutdown", handle])?;

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_running(handle)? {
                return Ok(());
            }
            thread::sleep(SHUTDOWN_POLL);
        }
        warn!(domain = handle, "Guest ignored shutdown, destroying");
        self.virsh(&["destroy", handle]).map(|_| ())
    }

    fn restart(&self, handle: &str) -> Result<(), BackendError> {
        if self.is_running(handle)? {
            self.virsh(&["reboot", handle]).map(|_| ())
        } else {
            self.start(handle)
        }
    }

    fn reset(&self, handle: &str) -> Result<(), BackendError> {
        self.virsh(&["reset", handle]).map(|_| ())
    }

    fn remove(&self, handle: &str) -> Result<(), BackendError> {
        if self.is_running(handle)? {
            self.virsh(&["destroy", handle])?;
        }
        self.virsh(&["undefine", handle])?;
        for path in [self.overlay_path(handle), self.definition_path(handle)] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn inspect(&self, handle_or_name: &str) -> Result<InstanceState, BackendError> {
        let running = self.is_running(handle_or_name)?;
        Ok(InstanceState {
            running,
            exit_code: 0,
            handle: handle_or_name.to_string(),
        })
    }

    fn artifact_exists(&self, name: &str, _timeout: Duration) -> Result<bool, BackendError> {
        Ok(self.artifact_path(name).is_file())
    }

    fn pull(&self, name: &str) -> Result<Box<dyn PullHandle>, BackendError> {
        let Some(base_url) = &self.artifact_base_url else {
            return Err(BackendError::Unsupported("pull"));
        };
        std::fs::create_dir_all(&self.image_dir)?;
        let target = self.artifact_path(name);
        let staged = self.image_dir.join(format!("{name}.part"));
        let url = format!("{}/{name}", base_url.trim_end_matches('/'));
        let args = vec![
            "-fsSL".to_string(),
            "-o".to_string(),
            staged.to_string_lossy().into_owned(),
            url,
        ];
        let pull = ProcessPull::spawn("curl", &args, Some((staged, target)))?;
        Ok(Box::new(pull))
    }

    fn commit(&self, _handle: &str, _artifact: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("commit"))
    }

    fn remove_artifact(&self, name: &str) -> Result<(), BackendError> {
        match std::fs::remove_file(self.artifact_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
