//! §4.3/E bridge (bus) slot allocation: PCI/PCIe/CCW.
use crate::error::DeviceError;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    Pci,
    Pcie,
    Ccw,
}

impl BridgeKind {
    pub const fn max_capacity(self) -> u32 {
        match self {
            BridgeKind::Pci | BridgeKind::Pcie => 30,
            BridgeKind::Ccw => 65535,
        }
    }
}

#[derive(Debug)]
pub struct Bridge {
    pub kind: BridgeKind,
    pub id: u32,
    slots: BTreeMap<u32, String>,
}

impl Bridge {
    pub fn new(kind: BridgeKind, id: u32) -> Self {
        Self {
            kind,
            id,
            slots: BTreeMap::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() as u32 >= self.kind.max_capacity()
    }

    /// Allocates the lowest free slot in `1..=max_capacity`.
    fn allocate(&mut self, device_id: &str) -> Option<u32> {
        for slot in 1..=self.kind.max_capacity() {
            if !self.slots.contains_key(&slot) {
                self.slots.insert(slot, device_id.to_string());
                return Some(slot);
            }
        }
        None
    }

    pub fn release(&mut self, slot: u32) {
        self.slots.remove(&slot);
    }

    pub fn occupied_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.keys().copied()
    }

    /// Formats the device address the way the VMM expects vs. what the
    /// guest sees for CCW devices (§4.3: `fe.<addr>.<slot>` / `0.<addr>.<slot>`).
    pub fn ccw_address(&self, addr: u32, slot: u32, for_guest: bool) -> String {
        if for_guest {
            format!("0.{addr}.{slot}")
        } else {
            format!("fe.{addr}.{slot}")
        }
    }
}

/// Owns every bridge of every kind and allocates across them, creating a
/// new bridge of the requested kind when all existing ones are full.
#[derive(Debug, Default)]
pub struct BridgeAllocator {
    bridges: Vec<Bridge>,
}

impl BridgeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    /// §4.3 "allocate the lowest available slot... If the bridge is full,
    /// allocate the next bridge; if none exist, return `bus_full`."
    pub fn allocate(
        &mut self,
        kind: BridgeKind,
        device_id: &str,
    ) -> Result<(u32, u32), DeviceError> {
        for bridge in self.bridges.iter_mut().filter(|b| b.kind == kind) {
            if let Some(slot) = bridge.allocate(device_id) {
                return Ok((bridge.id, slot));
            }
        }

        let new_id = self.bridges.iter().filter(|b| b.kind == kind).count() as u32;
        let mut bridge = Bridge::new(kind, new_id);
        match bridge.allocate(device_id) {
            Some(slot) => {
                self.bridges.push(bridge);
                Ok((new_id, slot))
            }
            None => Err(DeviceError::BusFull),
        }
    }

    pub fn release(&mut self, kind: BridgeKind, bridge_id: u32, slot: u32) {
        if let Some(bridge) = self
            .bridges
            .iter_mut()
            .find(|b| b.kind == kind && b.id == bridge_id)
        {
            bridge.release(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_slot_and_reuses_after_release() {
        let mut alloc = BridgeAllocator::new();
        for i in 0..30 {
            let (_, slot) = alloc.allocate(BridgeKind::Pci, &format!("dev{i}")).unwrap();
            assert_eq!(slot, i + 1);
        }
        alloc.release(BridgeKind::Pci, 0, 17);
        let (_, slot) = alloc.allocate(BridgeKind::Pci, "dev-reuse").unwrap();
        assert_eq!(slot, 17);
    }

    #[test]
    fn overflow_allocates_next_bridge() {
        let mut alloc = BridgeAllocator::new();
        for i in 0..30 {
            alloc.allocate(BridgeKind::Pci, &format!("dev{i}")).unwrap();
        }
        let (bridge_id, slot) = alloc.allocate(BridgeKind::Pci, "overflow").unwrap();
        assert_eq!(bridge_id, 1);
        assert_eq!(slot, 1);
    }

    #[test]
    fn single_bridge_reports_full_without_mutating_state() {
        let mut bridge = Bridge::new(BridgeKind::Pci, 0);
        for i in 0..30 {
            bridge.allocate(&format!("dev{i}")).unwrap();
        }
        assert!(bridge.is_full());
        let before: Vec<_> = bridge.occupied_slots().collect();
        assert!(bridge.allocate("overflow").is_none());
        let after: Vec<_> = bridge.occupied_slots().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn ccw_addresses_format_for_vmm_and_guest() {
        let bridge = Bridge::new(BridgeKind::Ccw, 0);
        assert_eq!(bridge.ccw_address(0, 5, false), "fe.0.5");
        assert_eq!(bridge.ccw_address(0, 5, true), "0.0.5");
    }
}
