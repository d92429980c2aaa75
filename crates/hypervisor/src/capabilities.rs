/// §4.2 "A bit-set ... declaring whether the backend supports" a feature.
/// The Sandbox engine consults this before invoking hot-plug paths rather
/// than relying on a backend silently no-op'ing (§9 Open Question).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub block_device_hotplug: bool,
    pub net_device_hotplug: bool,
    pub fs_sharing: bool,
    pub multi_queue: bool,
    pub memory_hotplug: bool,
    pub vcpu_hotplug: bool,
}

impl Capabilities {
    pub const fn none() -> Self {
        Self {
            block_device_hotplug: false,
            net_device_hotplug: false,
            fs_sharing: false,
            multi_queue: false,
            memory_hotplug: false,
            vcpu_hotplug: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            block_device_hotplug: true,
            net_device_hotplug: true,
            fs_sharing: true,
            multi_queue: true,
            memory_hotplug: true,
            vcpu_hotplug: true,
        }
    }
}
