//! CPU topology
//!
//! Socket and core ids of the logical CPUs, used only to order each
//! scheduler's steal ring so that idle schedulers look at same-socket peers
//! before crossing sockets. Nothing depends on it for correctness.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Placement of one logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    /// Logical CPU number, as used for affinity
    pub cpu: usize,
    /// Physical core id within the socket
    pub core: usize,
    /// Physical package (socket) id
    pub socket: usize,
}

/// The logical CPUs of a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    cpus: Vec<CpuInfo>,
}

impl Topology {
    /// Build a topology from explicit CPU descriptions.
    pub fn new(mut cpus: Vec<CpuInfo>) -> Self {
        cpus.sort_by_key(|c| c.cpu);
        Self { cpus }
    }

    /// The machine's topology, read once from sysfs.
    pub fn system() -> Option<&'static Topology> {
        static SYSTEM: Lazy<Option<Topology>> = Lazy::new(|| match SysfsTopology::new().load() {
            Ok(topology) => Some(topology),
            Err(e) => {
                log::debug!("CPU topology unavailable: {}", e);
                None
            }
        });
        SYSTEM.as_ref()
    }

    /// All CPUs, ordered by CPU number.
    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    /// Number of logical CPUs.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Whether no CPU is known.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// CPU numbers grouped by socket, sockets in id order.
    pub fn by_socket(&self) -> Vec<Vec<usize>> {
        let mut sockets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for cpu in &self.cpus {
            sockets.entry(cpu.socket).or_default().push(cpu.cpu);
        }
        sockets.into_values().collect()
    }

    /// Other logical CPUs sharing a physical core with `cpu`.
    pub fn siblings(&self, cpu: usize) -> Vec<usize> {
        let Some(me) = self.cpus.iter().find(|c| c.cpu == cpu) else {
            return Vec::new();
        };
        self.cpus
            .iter()
            .filter(|c| c.cpu != cpu && c.socket == me.socket && c.core == me.core)
            .map(|c| c.cpu)
            .collect()
    }
}

/// Reads topology from `/sys/devices/system/cpu`.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    /// Reader for the live system.
    pub fn new() -> Self {
        Self::with_root("/sys/devices/system/cpu")
    }

    /// Reader for a copy of the sysfs cpu directory at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scan every `cpuN` directory that has topology information.
    pub fn load(&self) -> Result<Topology> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::RuntimeError {
            reason: format!("cannot read {}: {}", self.root.display(), e),
        })?;

        let mut cpus = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(cpu) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            let topo = entry.path().join("topology");
            // Offline CPUs have no topology directory.
            if !topo.is_dir() {
                continue;
            }
            cpus.push(CpuInfo {
                cpu,
                core: read_id(&topo.join("core_id"))?,
                socket: read_id(&topo.join("physical_package_id"))?,
            });
        }

        if cpus.is_empty() {
            return Err(Error::RuntimeError {
                reason: format!("no CPU topology under {}", self.root.display()),
            });
        }
        Ok(Topology::new(cpus))
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

fn read_id(path: &Path) -> Result<usize> {
    let text = fs::read_to_string(path).map_err(|e| Error::RuntimeError {
        reason: format!("cannot read {}: {}", path.display(), e),
    })?;
    // Some platforms report -1 for an unknown package.
    let id: i64 = text.trim().parse().map_err(|_| Error::RuntimeError {
        reason: format!("bad id {:?} in {}", text.trim(), path.display()),
    })?;
    Ok(id.max(0) as usize)
}
