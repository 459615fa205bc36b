use core::num::NonZeroU64;

use crate::{backend::ty::transfer::Transfer, config::MAX_URBS, device::DeviceId};

/// URB 标识，单调递增且永不为 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrbId(NonZeroU64);

impl UrbId {
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// URB 在池中的槽位，后端通过它访问 URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbSlot(u8);

impl UrbSlot {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Application,
    Enumeration(DeviceId),
}

pub struct Urb {
    id: UrbId,
    pub(crate) transfer: Transfer,
    pub(crate) owner: Owner,
    pub(crate) channel: Option<u8>,
    pub(crate) transferred: usize,
    pub(crate) deadline: Option<u64>,
}

impl Urb {
    pub fn id(&self) -> UrbId {
        self.id
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    /// Hardware channel currently bound to this URB.
    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn remaining(&self) -> usize {
        self.transfer.length.saturating_sub(self.transferred)
    }
}

pub struct UrbPool {
    slots: [Option<Urb>; MAX_URBS],
    issued: u64,
}

impl Default for UrbPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UrbPool {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_URBS],
            issued: 0,
        }
    }

    /// Takes a free slot, or hands the transfer back when the pool is full.
    pub(crate) fn alloc(
        &mut self,
        transfer: Transfer,
        owner: Owner,
        deadline: Option<u64>,
    ) -> Result<(UrbSlot, UrbId), Transfer> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(transfer);
        };
        let id = UrbId(NonZeroU64::MIN.saturating_add(self.issued));
        self.issued += 1;
        self.slots[index] = Some(Urb {
            id,
            transfer,
            owner,
            channel: None,
            transferred: 0,
            deadline,
        });
        Ok((UrbSlot(index as u8), id))
    }

    pub fn get(&self, slot: UrbSlot) -> Option<&Urb> {
        self.slots.get(slot.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, slot: UrbSlot) -> Option<&mut Urb> {
        self.slots.get_mut(slot.index())?.as_mut()
    }

    pub fn find(&self, id: UrbId) -> Option<UrbSlot> {
        self.slots
            .iter()
            .position(|urb| urb.as_ref().is_some_and(|urb| urb.id == id))
            .map(|index| UrbSlot(index as u8))
    }

    pub(crate) fn free(&mut self, slot: UrbSlot) -> Option<Urb> {
        self.slots.get_mut(slot.index())?.take()
    }

    pub fn occupied(&self) -> heapless::Vec<UrbSlot, MAX_URBS> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, urb)| urb.is_some())
            .map(|(index, _)| UrbSlot(index as u8))
            .collect()
    }

    pub fn for_device(&self, dev: DeviceId) -> heapless::Vec<UrbSlot, MAX_URBS> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, urb)| urb.as_ref().is_some_and(|urb| urb.transfer.device == dev))
            .map(|(index, _)| UrbSlot(index as u8))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
