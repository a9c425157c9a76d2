//! The common header embedded in every blocking object.
use core::ptr::NonNull;

use crate::{
    klock::CpuLockCell,
    utils::Init,
    wait::{QueueOrder, WaitQueue},
    PortThreading,
};

/// Handle to the allocation backing a dynamically created object.
///
/// Present iff the object owns its storage; consumed exclusively by the
/// object's destroy operation.
pub(super) struct ResourceHandle(pub(super) NonNull<u8>);

// Safety: the handle is only dereferenced for deallocation, under the
// exclusive-ownership protocol of `destroy`/`delete`
unsafe impl Send for ResourceHandle {}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for ResourceHandle {}

/// The object header: the state every wait-capable primitive starts with.
pub(super) struct ObjectHeader<Traits: PortThreading> {
    /// Tasks parked on this object.
    pub(super) wait_queue: WaitQueue<Traits>,

    /// Backing storage handle for dynamically created objects.
    pub(super) res: CpuLockCell<Traits, Option<ResourceHandle>>,
}

impl<Traits: PortThreading> ObjectHeader<Traits> {
    pub(super) const fn new(order: QueueOrder) -> Self {
        Self {
            wait_queue: WaitQueue::new(order),
            res: CpuLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> Init for ObjectHeader<Traits> {
    const INIT: Self = Self::new(QueueOrder::Fifo);
}
