use nvme_sgl::AllocError;
use thiserror::Error;

use crate::{FaultPlan, NvmeController, NvmeStatus, SharedArena, SimDevice, SparseMemDisk};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("controller refused attach")]
    Refused,

    #[error("I/O queue creation failed: {0:?}")]
    QueueCreation(NvmeStatus),

    #[error("queue memory: {0}")]
    Alloc(#[from] AllocError),
}

/// Geometry and behaviour of one simulated controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Namespace size in logical blocks. 0 leaves the controller without an active namespace.
    pub namespace_blocks: u64,
    pub sector_size: u32,
    /// Identify MDTS (max transfer = 4 KiB << mdts, 0 = unlimited).
    pub mdts: u8,
    pub queue_size: u16,
    pub faults: FaultPlan,
    /// Make attach fail, as for a controller still bound to a kernel driver.
    pub refuse_attach: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            // 1 GiB at 512-byte sectors; sparse, so only written sectors cost memory.
            namespace_blocks: 0x20_0000,
            sector_size: 512,
            mdts: 5,
            queue_size: 64,
            faults: FaultPlan::default(),
            refuse_attach: false,
        }
    }
}

/// Enumerates simulated controllers sharing one DMA arena.
pub struct SimBus {
    arena: SharedArena,
    devices: Vec<(String, DeviceConfig)>,
}

impl SimBus {
    pub fn new(arena: SharedArena) -> Self {
        SimBus {
            arena,
            devices: Vec::new(),
        }
    }

    pub fn arena(&self) -> SharedArena {
        self.arena.clone()
    }

    /// Adds a controller and returns its PCI-style address.
    pub fn add_device(&mut self, config: DeviceConfig) -> String {
        let name = format!("{:04X}:{:02X}:{:02X}.{:02X}", 0, self.devices.len() + 1, 0, 0);
        self.devices.push((name.clone(), config));
        name
    }

    /// Attaches every configured controller, in bus order.
    pub fn attach_all(&self) -> Vec<(String, Result<SimDevice, AttachError>)> {
        self.devices
            .iter()
            .map(|(name, config)| (name.clone(), self.attach(name, config)))
            .collect()
    }

    fn attach(&self, name: &str, config: &DeviceConfig) -> Result<SimDevice, AttachError> {
        tracing::info!(device = name, "attaching NVMe driver");
        if config.refuse_attach {
            return Err(AttachError::Refused);
        }

        let disk = SparseMemDisk::new(config.sector_size, config.namespace_blocks);
        let mut ctrl = NvmeController::new(Box::new(disk), config.mdts);
        ctrl.set_faults(config.faults);
        SimDevice::attach(name.to_string(), ctrl, self.arena.clone(), config.queue_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvme_sgl::IoDevice;

    #[test]
    fn devices_are_named_by_bus_position() {
        let mut bus = SimBus::new(SharedArena::new(1024 * 1024));
        assert_eq!(bus.add_device(DeviceConfig::default()), "0000:01:00.00");
        assert_eq!(bus.add_device(DeviceConfig::default()), "0000:02:00.00");
        let names: Vec<String> = bus.attach_all().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["0000:01:00.00", "0000:02:00.00"]);
    }

    #[test]
    fn attach_reports_namespace_geometry() {
        let mut bus = SimBus::new(SharedArena::new(1024 * 1024));
        bus.add_device(DeviceConfig {
            sector_size: 4096,
            namespace_blocks: 0x40_0000,
            ..DeviceConfig::default()
        });
        bus.add_device(DeviceConfig {
            namespace_blocks: 0,
            ..DeviceConfig::default()
        });
        bus.add_device(DeviceConfig {
            refuse_attach: true,
            ..DeviceConfig::default()
        });

        let mut attached = bus.attach_all();
        assert_eq!(attached.len(), 3);
        assert_eq!(attached[2].1.as_ref().err(), Some(&AttachError::Refused));

        let ns = attached[0].1.as_ref().unwrap().default_namespace().unwrap();
        assert_eq!(ns.id, 1);
        assert_eq!(ns.sector_size, 4096);
        assert_eq!(ns.size_blocks, 0x40_0000);

        assert!(attached[1].1.as_ref().unwrap().default_namespace().is_none());

        // Queue memory is returned on detach.
        assert!(bus.arena().live_allocations() > 0);
        attached.clear();
        assert_eq!(bus.arena().live_allocations(), 0);
    }
}
