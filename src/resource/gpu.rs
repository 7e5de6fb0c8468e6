use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{error, warn};

use crate::error::RenderError;
use crate::gfx::Device;

/// Component owning device memory that must be rebuilt after a device loss.
///
/// Only buffers and render targets go through this cycle. Shaders, states and
/// vertex formats are kept by the device across a reset.
pub trait GpuResource {
    fn on_device_lost(&mut self, device: &mut dyn Device);
    fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey(u64);

struct Entry {
    key: ResourceKey,
    resource: Weak<RefCell<dyn GpuResource>>,
}

/// Registry broadcasting device lost/reset events.
///
/// Entries are weak: a component that was dropped without unregistering is
/// skipped and pruned on the next broadcast.
pub struct GpuResourceLib {
    entries: Vec<Entry>,
    next_key: u64,
    device_lost: bool,
}

impl GpuResourceLib {
    /// The registry starts in the lost state; the first
    /// [`on_device_reset`](Self::on_device_reset) allocates everything.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_key: 0,
            device_lost: true,
        }
    }

    pub fn register<R: GpuResource + 'static>(&mut self, resource: &Rc<RefCell<R>>) -> ResourceKey {
        let weak = Rc::downgrade(resource);
        let weak: Weak<RefCell<dyn GpuResource>> = weak;
        self.next_key += 1;
        let key = ResourceKey(self.next_key);
        self.entries.push(Entry {
            key,
            resource: weak,
        });
        key
    }

    pub fn unregister(&mut self, key: ResourceKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != key);
        self.entries.len() != before
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.resource.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_device_lost(&mut self, device: &mut dyn Device) {
        self.prune();
        for entry in &self.entries {
            let Some(resource) = entry.resource.upgrade() else {
                continue;
            };
            match resource.try_borrow_mut() {
                Ok(mut resource) => resource.on_device_lost(device),
                Err(_) => warn!("GPU resource {:?} is busy during device loss", entry.key),
            };
        }
        self.device_lost = true;
    }

    /// Re-creates every registered resource. All resources are visited even
    /// when one fails; the first failure is returned.
    pub fn on_device_reset(&mut self, device: &mut dyn Device) -> Result<(), RenderError> {
        self.prune();
        let mut first_error = None;
        for entry in &self.entries {
            let Some(resource) = entry.resource.upgrade() else {
                continue;
            };
            let result = match resource.try_borrow_mut() {
                Ok(mut resource) => resource.on_device_reset(device),
                Err(_) => Err(RenderError::InvariantViolation(format!(
                    "GPU resource {:?} is busy during device reset",
                    entry.key
                ))),
            };
            if let Err(err) = result {
                error!("Failed to restore GPU resource {:?}: {}", entry.key, err);
                first_error.get_or_insert(err);
            }
        }
        self.device_lost = false;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn prune(&mut self) {
        self.entries.retain(|entry| entry.resource.strong_count() > 0);
    }
}

impl Default for GpuResourceLib {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::RecordingDevice;

    #[derive(Default)]
    struct Counter {
        lost: usize,
        reset: usize,
    }

    impl GpuResource for Counter {
        fn on_device_lost(&mut self, _device: &mut dyn Device) {
            self.lost += 1;
        }

        fn on_device_reset(&mut self, _device: &mut dyn Device) -> Result<(), RenderError> {
            self.reset += 1;
            Ok(())
        }
    }

    #[test]
    fn broadcasts_reach_registered_resources() {
        let mut device = RecordingDevice::new();
        let mut lib = GpuResourceLib::new();
        let counter = Rc::new(RefCell::new(Counter::default()));
        lib.register(&counter);

        assert!(lib.is_device_lost());
        lib.on_device_reset(&mut device).unwrap();
        lib.on_device_lost(&mut device);
        lib.on_device_reset(&mut device).unwrap();

        assert!(!lib.is_device_lost());
        assert_eq!(counter.borrow().reset, 2);
        assert_eq!(counter.borrow().lost, 1);
    }

    #[test]
    fn dropped_and_unregistered_resources_are_skipped() {
        let mut device = RecordingDevice::new();
        let mut lib = GpuResourceLib::new();
        let kept = Rc::new(RefCell::new(Counter::default()));
        let removed = Rc::new(RefCell::new(Counter::default()));
        lib.register(&kept);
        let key = lib.register(&removed);
        {
            let dropped = Rc::new(RefCell::new(Counter::default()));
            lib.register(&dropped);
        }

        assert!(lib.unregister(key));
        assert_eq!(lib.len(), 1);
        lib.on_device_reset(&mut device).unwrap();

        assert_eq!(kept.borrow().reset, 1);
        assert_eq!(removed.borrow().reset, 0);
    }
}
