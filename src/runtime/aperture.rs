use std::collections::BTreeMap;

const PAGE_SIZE: u64 = 4096;

/// A first-fit allocator over a range of GPU virtual address space.
///
/// Each reservation is surrounded by `guard_pages` unmapped pages on both sides.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Reserved ranges including guards: start -> length
    reserved: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(1),
            guard_pages,
            reserved: BTreeMap::new(),
        }
    }

    const fn guard_bytes(&self) -> u64 {
        self.guard_pages * PAGE_SIZE
    }

    fn align_up(val: u64, align: u64) -> Option<u64> {
        let mask = align - 1;
        val.checked_add(mask).map(|v| v & !mask)
    }

    /// Reserve `size` bytes. Returns the usable address, past the leading guard.
    pub fn allocate_va(&mut self, size: u64) -> Option<u64> {
        let guard = self.guard_bytes();
        let span = Self::align_up(size.max(1), PAGE_SIZE)?.checked_add(guard * 2)?;

        let mut candidate = Self::align_up(self.base, self.align)?;
        for (&start, &len) in &self.reserved {
            if start >= candidate && start - candidate >= span {
                break;
            }
            candidate = candidate.max(Self::align_up(start + len, self.align)?);
        }

        let end = candidate.checked_add(span)?;
        if end - 1 > self.limit {
            return None;
        }

        self.reserved.insert(candidate, span);
        Some(candidate + guard)
    }

    /// Release a reservation made by `allocate_va`. Returns `false` if `addr` was not reserved.
    pub fn free_va(&mut self, addr: u64) -> bool {
        addr.checked_sub(self.guard_bytes())
            .and_then(|start| self.reserved.remove(&start))
            .is_some()
    }

    #[must_use]
    pub fn reserved_ranges(&self) -> usize {
        self.reserved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_disjoint_and_guarded() {
        let mut ap = Aperture::new(0x1_0000, 0x10_0000 - 1, PAGE_SIZE, 1);
        let a = ap.allocate_va(100).unwrap();
        let b = ap.allocate_va(PAGE_SIZE).unwrap();

        assert_eq!(a, 0x1_0000 + PAGE_SIZE);
        // a's page + trailing guard + b's leading guard
        assert_eq!(b, a + PAGE_SIZE * 3);
        assert!(b + PAGE_SIZE <= 0x10_0000);
    }

    #[test]
    fn freed_hole_is_reused_first() {
        let mut ap = Aperture::new(0, 0x10_0000 - 1, PAGE_SIZE, 0);
        let a = ap.allocate_va(PAGE_SIZE).unwrap();
        let _b = ap.allocate_va(PAGE_SIZE).unwrap();

        assert!(ap.free_va(a));
        assert_eq!(ap.allocate_va(PAGE_SIZE), Some(a));
        assert_eq!(ap.reserved_ranges(), 2);
    }

    #[test]
    fn exhaustion_and_unknown_free() {
        let mut ap = Aperture::new(0, 2 * PAGE_SIZE - 1, PAGE_SIZE, 0);
        assert!(ap.allocate_va(2 * PAGE_SIZE).is_some());
        assert!(ap.allocate_va(1).is_none());
        assert!(!ap.free_va(0xdead_0000));
    }
}
