//! Memory accounting.
//!
//! Connections pre-reserve memory from a process-wide [`MemoryPool`] in
//! [`MEM_QUANTUM`] units and spend it byte by byte. The per-connection ledger
//! ([`ForwardMemory`]) keeps `reserved * MEM_QUANTUM == forward_alloc + charged`
//! at all times, so a connection can always hand back exactly what it took.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::core::constants::MEM_QUANTUM;
use crate::core::{NdConfig, NdError};

/// Errors from the memory pool.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// Reservation would cross the high watermark.
    #[error("memory pool exhausted: requested {requested} quanta, {available} available")]
    Exhausted {
        /// Quanta requested.
        requested: usize,
        /// Quanta left below the high watermark.
        available: usize,
    },
}

impl From<MemoryError> for NdError {
    fn from(_: MemoryError) -> Self {
        NdError::NoMemory
    }
}

/// Process-wide memory budget shared by every connection of a stack.
#[derive(Debug)]
pub struct MemoryPool {
    allocated: AtomicUsize,
    low: usize,
    default: usize,
    high: usize,
}

impl MemoryPool {
    /// Create a pool with explicit `[low, default, high]` watermarks in quanta.
    pub fn new(limits: [usize; 3]) -> Self {
        let [low, default, high] = limits;
        Self {
            allocated: AtomicUsize::new(0),
            low,
            default,
            high,
        }
    }

    /// Create a pool sized from the configuration.
    pub fn from_config(config: &NdConfig) -> Self {
        Self::new(config.mem_limits())
    }

    /// Reserve `quanta` units, failing above the high watermark.
    pub fn try_reserve(&self, quanta: usize) -> Result<(), MemoryError> {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current + quanta;
            if next > self.high {
                return Err(MemoryError::Exhausted {
                    requested: quanta,
                    available: self.high.saturating_sub(current),
                });
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `quanta` units to the pool.
    pub fn release(&self, quanta: usize) {
        let previous = self.allocated.fetch_sub(quanta, Ordering::AcqRel);
        debug_assert!(previous >= quanta, "memory pool underflow");
    }

    /// Units currently reserved.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Whether usage is above the default watermark.
    pub fn under_pressure(&self) -> bool {
        self.allocated() > self.default
    }

    /// Whether usage is below the low watermark.
    pub fn is_relaxed(&self) -> bool {
        self.allocated() < self.low
    }

    /// Whether no further reservation of one unit can succeed.
    pub fn is_exhausted(&self) -> bool {
        self.allocated() >= self.high
    }

    /// `[low, default, high]` watermarks in quanta.
    pub fn limits(&self) -> [usize; 3] {
        [self.low, self.default, self.high]
    }
}

/// Per-connection forward-allocated memory ledger.
#[derive(Debug, Default)]
pub struct ForwardMemory {
    forward_alloc: usize,
    charged: usize,
    forward_deficit: usize,
}

impl ForwardMemory {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently charged to queued segments.
    pub fn charged(&self) -> usize {
        self.charged
    }

    /// Reserved but unspent bytes.
    pub fn forward_alloc(&self) -> usize {
        self.forward_alloc
    }

    /// Bytes freed by the reader but not yet returned.
    pub fn forward_deficit(&self) -> usize {
        self.forward_deficit
    }

    /// Units this ledger holds in the pool.
    pub fn reserved_quanta(&self) -> usize {
        (self.forward_alloc + self.charged) / MEM_QUANTUM
    }

    /// Charge `size` bytes, topping up the forward quota from the pool.
    pub fn charge(&mut self, size: usize, pool: &MemoryPool) -> Result<(), MemoryError> {
        if self.forward_alloc < size {
            let quanta = (size - self.forward_alloc).div_ceil(MEM_QUANTUM);
            pool.try_reserve(quanta)?;
            self.forward_alloc += quanta * MEM_QUANTUM;
        }
        self.forward_alloc -= size;
        self.charged += size;
        Ok(())
    }

    /// Undo a charge for a segment that was dropped right after charging.
    ///
    /// The bytes return to the forward quota, not to the pool.
    pub fn uncharge(&mut self, size: usize) {
        self.charged -= size;
        self.forward_alloc += size;
    }

    /// Release `size` bytes after the reader consumed them.
    ///
    /// The release accumulates into the deficit and is deferred while the
    /// deficit is below a quarter of `rcvbuf` and the reader queue still holds
    /// data. One byte of quota stays back so a partial unit remains reserved.
    /// Returns the bytes handed back to the pool (zero when deferred).
    pub fn release_partial(
        &mut self,
        size: usize,
        reader_has_data: bool,
        rcvbuf: usize,
        pool: &MemoryPool,
    ) -> usize {
        self.forward_deficit += size;
        if self.forward_deficit < rcvbuf / 4 && reader_has_data {
            return 0;
        }
        let size = std::mem::take(&mut self.forward_deficit);
        self.flush(size, 1, pool)
    }

    /// Release `size` bytes together with any deferred deficit.
    pub fn release_full(&mut self, size: usize, pool: &MemoryPool) -> usize {
        let size = size + std::mem::take(&mut self.forward_deficit);
        self.flush(size, 0, pool)
    }

    /// Return every reserved unit to the pool and zero the ledger.
    pub fn reclaim_all(&mut self, pool: &MemoryPool) -> usize {
        let quanta = self.reserved_quanta();
        if quanta > 0 {
            pool.release(quanta);
        }
        *self = Self::default();
        quanta * MEM_QUANTUM
    }

    fn flush(&mut self, size: usize, hold_back: usize, pool: &MemoryPool) -> usize {
        self.forward_alloc += size;
        self.charged -= size;
        let amt = self.forward_alloc.saturating_sub(hold_back) & !(MEM_QUANTUM - 1);
        self.forward_alloc -= amt;
        if amt > 0 {
            pool.release(amt / MEM_QUANTUM);
        }
        amt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MemoryPool {
        MemoryPool::new([6, 8, 12])
    }

    #[test]
    fn test_pool_high_watermark() {
        let pool = pool();
        pool.try_reserve(10).unwrap();
        assert!(pool.under_pressure());
        let err = pool.try_reserve(3).unwrap_err();
        assert_eq!(
            err,
            MemoryError::Exhausted {
                requested: 3,
                available: 2
            }
        );
        pool.try_reserve(2).unwrap();
        assert!(pool.is_exhausted());
        pool.release(12);
        assert!(pool.is_relaxed());
    }

    #[test]
    fn test_charge_reserves_whole_quanta() {
        let pool = pool();
        let mut mem = ForwardMemory::new();
        mem.charge(100, &pool).unwrap();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(mem.forward_alloc(), MEM_QUANTUM - 100);
        mem.charge(MEM_QUANTUM, &pool).unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(mem.charged(), MEM_QUANTUM + 100);
        assert_eq!(mem.reserved_quanta(), 2);
    }

    #[test]
    fn test_charge_fails_when_pool_exhausted() {
        let pool = MemoryPool::new([1, 1, 1]);
        let mut mem = ForwardMemory::new();
        mem.charge(MEM_QUANTUM, &pool).unwrap();
        assert!(mem.charge(1, &pool).is_err());
        assert_eq!(mem.charged(), MEM_QUANTUM);
    }

    #[test]
    fn test_partial_release_defers_while_reader_has_data() {
        let pool = pool();
        let mut mem = ForwardMemory::new();
        let rcvbuf = 8 * MEM_QUANTUM;
        mem.charge(4 * MEM_QUANTUM, &pool).unwrap();
        assert_eq!(pool.allocated(), 4);

        // below rcvbuf / 4 with data still queued: deferred
        assert_eq!(mem.release_partial(MEM_QUANTUM, true, rcvbuf, &pool), 0);
        assert_eq!(mem.forward_deficit(), MEM_QUANTUM);
        assert_eq!(mem.charged(), 4 * MEM_QUANTUM);
        assert_eq!(pool.allocated(), 4);

        // deficit reaches the threshold: flushed, one partial unit held back
        let returned = mem.release_partial(MEM_QUANTUM, true, rcvbuf, &pool);
        assert_eq!(returned, MEM_QUANTUM);
        assert_eq!(mem.forward_deficit(), 0);
        assert_eq!(mem.charged(), 2 * MEM_QUANTUM);
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn test_partial_release_flushes_when_reader_empty() {
        let pool = pool();
        let mut mem = ForwardMemory::new();
        mem.charge(2 * MEM_QUANTUM, &pool).unwrap();
        let returned = mem.release_partial(2 * MEM_QUANTUM, false, 64 * MEM_QUANTUM, &pool);
        assert_eq!(returned, MEM_QUANTUM);
        assert_eq!(mem.charged(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_full_release_includes_deficit() {
        let pool = pool();
        let mut mem = ForwardMemory::new();
        mem.charge(3 * MEM_QUANTUM, &pool).unwrap();
        mem.release_partial(MEM_QUANTUM, true, 64 * MEM_QUANTUM, &pool);
        let returned = mem.release_full(2 * MEM_QUANTUM, &pool);
        assert_eq!(returned, 3 * MEM_QUANTUM);
        assert_eq!(mem.forward_deficit(), 0);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_reclaim_all_returns_exact_reservation() {
        let pool = pool();
        let mut mem = ForwardMemory::new();
        mem.charge(1000, &pool).unwrap();
        mem.charge(5000, &pool).unwrap();
        mem.release_partial(700, true, 64 * MEM_QUANTUM, &pool);
        let held = mem.reserved_quanta();
        assert_eq!(pool.allocated(), held);
        mem.reclaim_all(&pool);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(mem.reserved_quanta(), 0);
    }
}
