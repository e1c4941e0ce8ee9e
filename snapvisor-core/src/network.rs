// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Fixed-capacity pool of network attachment points.
//!
//! Each slot describes one pre-provisioned tap device and the /30 subnet the
//! guest behind it uses. Slots are handed out as [`SlotLease`]s which return
//! their slot to the free list when dropped, so a failed or cancelled
//! operation can never leak one.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::{HardValidationError, PoolError};
use crate::metrics::NETWORK_SLOTS_IN_USE;
use crate::types::Namespace;

/// Upper bound on pool capacity (keeps every slot inside 172.16.0.0/20).
pub const MAX_POOL_CAPACITY: usize = 1024;

/// One network attachment point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSlot {
    pub index: usize,
    pub tap_name: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: String,
}

impl NetworkSlot {
    fn derive(namespace: &Namespace, index: usize) -> Self {
        // Linux interface names are limited to 15 bytes.
        let prefix: String = namespace.as_str().chars().take(4).collect();
        let base = (index * 4) as u32;
        let subnet = Ipv4Addr::new(172, 16, (base >> 8) as u8, (base & 0xff) as u8);
        let subnet = u32::from(subnet);

        Self {
            index,
            tap_name: format!("tap-{}-{}", prefix, index),
            host_ip: Ipv4Addr::from(subnet + 1),
            guest_ip: Ipv4Addr::from(subnet + 2),
            guest_mac: format!("AA:FC:00:00:{:02X}:{:02X}", index >> 8, index & 0xff),
        }
    }
}

struct PoolState {
    free: VecDeque<usize>,
    closed: bool,
}

struct PoolInner {
    slots: Vec<NetworkSlot>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Pool state is a plain free list; a panicked holder cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_use(state: &PoolState, capacity: usize) -> usize {
        capacity - state.free.len()
    }
}

/// Thread-safe pool of network slots.
#[derive(Clone)]
pub struct NetworkPool {
    inner: Arc<PoolInner>,
}

impl NetworkPool {
    /// Create a pool of `capacity` slots for `namespace`.
    pub fn new(namespace: &Namespace, capacity: usize) -> Result<Self, HardValidationError> {
        if capacity == 0 || capacity > MAX_POOL_CAPACITY {
            return Err(HardValidationError::OutOfBounds {
                field: "pool_size",
                value: capacity as u64,
                min: 1,
                max: MAX_POOL_CAPACITY as u64,
            });
        }

        let slots = (0..capacity)
            .map(|index| NetworkSlot::derive(namespace, index))
            .collect();

        tracing::info!(namespace = %namespace, capacity = capacity, "Network pool created");

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                state: Mutex::new(PoolState {
                    free: (0..capacity).collect(),
                    closed: false,
                }),
            }),
        })
    }

    /// Lease a free slot without waiting.
    pub fn try_acquire(&self) -> Result<SlotLease, PoolError> {
        let mut state = self.inner.lock();

        if state.closed {
            return Err(PoolError::Closed);
        }

        let index = state.free.pop_front().ok_or(PoolError::Exhausted {
            capacity: self.capacity(),
        })?;

        NETWORK_SLOTS_IN_USE.set(PoolInner::in_use(&state, self.capacity()) as i64);
        tracing::trace!(slot = index, "Network slot leased");

        Ok(SlotLease {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of slots currently leased.
    pub fn in_use(&self) -> usize {
        PoolInner::in_use(&self.inner.lock(), self.capacity())
    }

    /// Number of slots available for lease.
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Close the pool. Fails if any slot is still leased.
    pub fn teardown(&self) -> Result<(), PoolError> {
        let mut state = self.inner.lock();
        let outstanding = PoolInner::in_use(&state, self.capacity());
        if outstanding > 0 {
            return Err(PoolError::LeasesOutstanding { outstanding });
        }
        state.closed = true;
        tracing::info!(capacity = self.capacity(), "Network pool torn down");
        Ok(())
    }

    /// Whether the pool has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl std::fmt::Debug for NetworkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive hold on one network slot. Returned to the pool on drop.
pub struct SlotLease {
    inner: Arc<PoolInner>,
    index: usize,
}

impl SlotLease {
    /// The leased slot.
    pub fn slot(&self) -> &NetworkSlot {
        &self.inner.slots[self.index]
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let capacity = self.inner.slots.len();
        let mut state = self.inner.lock();
        state.free.push_back(self.index);
        NETWORK_SLOTS_IN_USE.set(PoolInner::in_use(&state, capacity) as i64);
        tracing::trace!(slot = self.index, "Network slot released");
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SlotLease").field(&self.slot().tap_name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> NetworkPool {
        NetworkPool::new(&Namespace::default(), capacity).unwrap()
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(NetworkPool::new(&Namespace::default(), 0).is_err());
        assert!(NetworkPool::new(&Namespace::default(), MAX_POOL_CAPACITY + 1).is_err());
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = pool(1);
        let lease = pool.try_acquire().unwrap();
        assert_eq!(pool.in_use(), 1);
        assert!(matches!(
            pool.try_acquire(),
            Err(PoolError::Exhausted { capacity: 1 })
        ));

        drop(lease);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn test_slot_addressing_is_disjoint() {
        let a = NetworkSlot::derive(&Namespace::default(), 0);
        let b = NetworkSlot::derive(&Namespace::default(), 1);
        let last = NetworkSlot::derive(&Namespace::default(), MAX_POOL_CAPACITY - 1);

        assert_eq!(a.host_ip, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(a.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(b.guest_ip, Ipv4Addr::new(172, 16, 0, 6));
        assert_eq!(last.guest_ip, Ipv4Addr::new(172, 16, 15, 254));
        assert_ne!(a.guest_mac, b.guest_mac);
        assert!(last.tap_name.len() <= 15);
    }

    #[test]
    fn test_teardown_requires_all_returned() {
        let pool = pool(2);
        let lease = pool.try_acquire().unwrap();
        assert!(matches!(
            pool.teardown(),
            Err(PoolError::LeasesOutstanding { outstanding: 1 })
        ));
        drop(lease);
        pool.teardown().unwrap();
        assert!(pool.is_closed());
        assert!(matches!(pool.try_acquire(), Err(PoolError::Closed)));
    }

    #[test]
    fn test_concurrent_leases_never_exceed_capacity() {
        use std::thread;

        let pool = pool(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut held = 0;
                    for _ in 0..200 {
                        if let Ok(lease) = pool.try_acquire() {
                            assert!(pool.in_use() <= 4);
                            held += 1;
                            drop(lease);
                        }
                    }
                    held
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 4);
    }
}
