//! Types used in public API

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::{RdmaLibError, Result};

/// Slot plus generation of a live connection in the [`crate::ConnectionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub slot: u16,
    pub generation: u16,
}

impl ConnectionHandle {
    pub fn as_u32(self) -> u32 {
        ((self.generation as u32) << 16) | self.slot as u32
    }

    pub fn from_u32(raw: u32) -> Self {
        Self { slot: raw as u16, generation: (raw >> 16) as u16 }
    }
}

/// Work request id carried through the fabric.
///
/// The upper 32 bits identify the owning connection, the lower 32 bits are a
/// caller-chosen correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct WrId(pub u64);

impl WrId {
    pub fn new(handle: ConnectionHandle, correlation: u32) -> Self {
        Self(((handle.as_u32() as u64) << 32) | correlation as u64)
    }

    pub fn handle(self) -> ConnectionHandle {
        ConnectionHandle::from_u32((self.0 >> 32) as u32)
    }

    pub fn correlation(self) -> u32 {
        self.0 as u32
    }
}

/// Memory region access permissions. Bit values follow `ibv_access_flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const NONE: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A registered memory region as seen by the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredRegion {
    pub addr: u64,
    pub length: u64,
    pub lkey: u32,
    pub rkey: u32,
}

impl RegisteredRegion {
    /// The part of the region a peer needs to target it.
    pub fn descriptor(&self) -> MemoryRegionDescriptor {
        MemoryRegionDescriptor { addr: self.addr, length: self.length, rkey: self.rkey }
    }

    pub fn contains(&self, addr: u64, length: u64) -> bool {
        addr >= self.addr
            && addr
                .checked_add(length)
                .is_some_and(|end| end <= self.addr + self.length)
    }
}

/// Remote-accessible memory descriptor exchanged in meta messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryRegionDescriptor {
    pub addr: u64,
    pub length: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Write,
    WriteWithImm(u32),
    Read,
}

/// One RDMA read or write against a peer's descriptor.
///
/// For writes data flows from `local_addr` into `dst`. For reads it flows
/// from `dst` into `local_addr`.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    pub dst: MemoryRegionDescriptor,
    pub dst_offset: u64,
    pub src: RegisteredRegion,
    pub local_addr: u64,
    pub length: u32,
    pub kind: TransferKind,
    pub correlation: u32,
}

impl TransferRequest {
    pub fn remote_addr(&self) -> u64 {
        self.dst.addr + self.dst_offset
    }

    pub fn validate(&self) -> Result<()> {
        let length = self.length as u64;
        if self.dst_offset.checked_add(length).is_none_or(|end| end > self.dst.length) {
            return Err(RdmaLibError::OutOfBounds {
                offset: self.dst_offset,
                length,
                limit: self.dst.length,
            });
        }
        if !self.src.contains(self.local_addr, length) {
            return Err(RdmaLibError::OutOfBounds {
                offset: self.local_addr.wrapping_sub(self.src.addr),
                length,
                limit: self.src.length,
            });
        }
        Ok(())
    }
}
