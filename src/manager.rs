//! The region manager (SPEC_FULL.md §4.4): `init`, `sbrk`, `brk`, `map`,
//! `unmap`, `remap`, and `is_sane`, plus the diagnostic surface (§6).

use core::ptr::NonNull;

use spin::Mutex;

use crate::coverage::{index, CoverageTable};
use crate::descriptor::{DescriptorPool, Vad};
use crate::error::ManagerError;
use crate::flags::{MapFlags, ProtFlags, RemapFlags};
use crate::gap::{find_gap, Gap};
use crate::vad_list::VadList;
use crate::{round_up_to_page, PAGE_SIZE};

#[cfg(feature = "coverage")]
use crate::coverage;

const MAGIC: u64 = 0x464c_4154_4d4d_414e; // "FLATMMAN" squeezed into 8 bytes.
const SCRUB_BYTE: u8 = 0xDD;

struct State {
    base: usize,
    end: usize,
    size: usize,
    start: usize,
    brk: usize,
    map: usize,
    vad_list: VadList,
    pool: DescriptorPool,
    magic: u64,
    initialized: bool,
    sanity: bool,
    scrub: bool,
    last_err: Option<ManagerError>,
    coverage: CoverageTable,
}

// SAFETY: every pointer `State` holds addresses memory inside
// `[base, end)`, which the `RegionManager` that owns this `State` behind a
// mutex was given exclusive ownership of at `init` time. All access to that
// memory (and to these pointers) happens only while the mutex is held.
unsafe impl Send for State {}

/// A flat-region virtual memory manager.
///
/// Owns one contiguous, page-aligned byte range and services `sbrk`, `brk`,
/// `map`, `unmap`, and `remap` against it, without ever calling into the
/// host operating system (see the crate-level docs and SPEC_FULL.md §§2-4
/// for the region layout and the algorithms below).
///
/// All operations take `&self` and serialize internally through a mutex, so
/// a `RegionManager` can be shared across threads (e.g. behind an `Arc`)
/// without an outer lock.
pub struct RegionManager {
    inner: Mutex<State>,
}

impl RegionManager {
    /// Takes ownership of `[base, base + size)` and prepares it for use.
    ///
    /// # Errors
    /// Returns [`ErrorKind::InvalidParameter`](crate::ErrorKind::InvalidParameter)
    /// if `base` or `size` is zero, either is not page-aligned, or the
    /// region is too small to hold its own descriptor table.
    ///
    /// # Safety
    /// `base` must be a pointer to at least `size` bytes of memory that the
    /// caller exclusively hands over to this manager for its entire
    /// lifetime: no other code may read, write, or free any byte in that
    /// range for as long as the returned `RegionManager` is alive.
    pub unsafe fn init(base: *mut u8, size: usize) -> Result<Self, ManagerError> {
        let base_addr = base as usize;
        if base_addr == 0 || size == 0 {
            return Err(ManagerError::invalid_parameter(
                "base and size must be non-zero",
            ));
        }
        if base_addr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(ManagerError::invalid_parameter(
                "base and size must be page-aligned",
            ));
        }

        let capacity = size / PAGE_SIZE;
        let vad_bytes = capacity
            .checked_mul(core::mem::size_of::<Vad>())
            .ok_or_else(|| ManagerError::invalid_parameter("region too large for a descriptor table"))?;
        let end = base_addr
            .checked_add(size)
            .ok_or_else(|| ManagerError::invalid_parameter("base + size overflows"))?;
        let start = round_up_to_page(
            base_addr
                .checked_add(vad_bytes)
                .ok_or_else(|| ManagerError::invalid_parameter("base + size overflows"))?,
        );
        if start >= end {
            return Err(ManagerError::invalid_parameter(
                "region is too small to hold its own descriptor table",
            ));
        }

        let pool_base = NonNull::new(base.cast::<Vad>())
            .ok_or_else(|| ManagerError::invalid_parameter("base must be non-null"))?;
        core::ptr::write_bytes(base, 0, vad_bytes);
        let pool = DescriptorPool::new(pool_base, capacity);

        log::debug!(
            "flatmman: init base=0x{base_addr:x} size=0x{size:x} start=0x{start:x} end=0x{end:x} vad_capacity={capacity}"
        );

        Ok(Self {
            inner: Mutex::new(State {
                base: base_addr,
                end,
                size,
                start,
                brk: start,
                map: end,
                vad_list: VadList::new(),
                pool,
                magic: MAGIC,
                initialized: true,
                sanity: false,
                scrub: false,
                last_err: None,
                coverage: CoverageTable::new(),
            }),
        })
    }

    /// Returns the current BREAK top unchanged (`delta == 0`), or advances it
    /// by `delta` bytes and returns the *old* value. Fails with
    /// [`OutOfMemory`](crate::ErrorKind::OutOfMemory) if `delta` would push
    /// `brk` past `map`. There is no negative `delta`: shrink the BREAK
    /// region with [`RegionManager::brk`] instead.
    pub fn sbrk(&self, delta: usize) -> Result<usize, ManagerError> {
        self.locked("sbrk", |state| state.sbrk_locked(delta))
    }

    /// Sets the BREAK top to `addr`, which must lie in `[start, map)`.
    pub fn brk(&self, addr: usize) -> Result<(), ManagerError> {
        self.locked("brk", |state| state.brk_locked(addr))
    }

    /// Reserves `length` bytes (rounded up to a page multiple) in MAPPED and
    /// returns their start address, zero-filled. `addr_hint` must be `None`:
    /// fixed-address mapping is not supported (SPEC_FULL.md §9). `prot` must
    /// be readable and writable but not executable; `flags` must be
    /// anonymous and private, and neither shared nor fixed.
    pub fn map(
        &self,
        addr_hint: Option<usize>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<usize, ManagerError> {
        self.locked("map", |state| state.map_locked(addr_hint, length, prot, flags))
    }

    /// Releases `[addr, addr + length)`, which must fall entirely inside one
    /// assigned descriptor. `addr` and `length` must be page-aligned and
    /// `length` non-zero.
    pub fn unmap(&self, addr: usize, length: usize) -> Result<(), ManagerError> {
        self.locked("unmap", |state| state.unmap_locked(addr, length))
    }

    /// Resizes the mapping containing `[addr, addr + old_size)` to
    /// `new_size`, returning its (possibly new) address. `flags` must be
    /// exactly [`RemapFlags::MAY_MOVE`].
    pub fn remap(
        &self,
        addr: usize,
        old_size: usize,
        new_size: usize,
        flags: RemapFlags,
    ) -> Result<usize, ManagerError> {
        self.locked("remap", |state| {
            state.remap_locked(addr, old_size, new_size, flags)
        })
    }

    /// Walks every invariant in SPEC_FULL.md §3 and returns whether they all
    /// hold. On failure, also updates [`RegionManager::last_error`].
    pub fn is_sane(&self) -> bool {
        let mut state = self.inner.lock();
        match state.check_sanity() {
            Ok(()) => true,
            Err(e) => {
                state.last_err = Some(e);
                false
            }
        }
    }

    /// Enables or disables the full invariant check at the entry and exit of
    /// every mutating operation.
    pub fn set_sanity(&self, enabled: bool) {
        self.inner.lock().sanity = enabled;
    }

    /// Enables or disables overwriting released bytes with `0xDD`.
    pub fn set_scrub(&self, enabled: bool) {
        self.inner.lock().scrub = enabled;
    }

    /// The error from the most recent failing operation, if any.
    pub fn last_error(&self) -> Option<ManagerError> {
        self.inner.lock().last_err
    }

    /// The per-branch coverage table (SPEC_FULL.md §8). Only present when
    /// the `coverage` Cargo feature is enabled.
    #[cfg(feature = "coverage")]
    pub fn coverage(&self) -> [bool; coverage::index::COUNT] {
        *self.inner.lock().coverage.hits()
    }

    /// Whether every named branch in SPEC_FULL.md §8 has fired at least
    /// once. Only present when the `coverage` Cargo feature is enabled.
    #[cfg(feature = "coverage")]
    pub fn coverage_complete(&self) -> bool {
        self.inner.lock().coverage.all_hit()
    }

    fn locked<F, R>(&self, op: &str, f: F) -> Result<R, ManagerError>
    where
        F: FnOnce(&mut State) -> Result<R, ManagerError>,
    {
        let mut state = self.inner.lock();

        if state.sanity {
            if let Err(e) = state.check_sanity() {
                state.last_err = Some(e);
                log::debug!("flatmman: {op}: pre-condition sanity check failed: {e}");
                return Err(e);
            }
        }

        match f(&mut state) {
            Ok(value) => {
                log::trace!("flatmman: {op} ok");
                if state.sanity {
                    if let Err(e) = state.check_sanity() {
                        state.last_err = Some(e);
                        log::debug!("flatmman: {op}: post-condition sanity check failed: {e}");
                        return Err(e);
                    }
                }
                Ok(value)
            }
            Err(e) => {
                state.last_err = Some(e);
                log::debug!("flatmman: {op} failed: {e}");
                Err(e)
            }
        }
    }
}

impl State {
    fn ensure_initialized(&self) -> Result<(), ManagerError> {
        if self.magic != MAGIC || !self.initialized {
            return Err(ManagerError::unexpected("manager is not initialized"));
        }
        Ok(())
    }

    fn resync_map(&mut self) {
        self.map = match self.vad_list.head() {
            Some(head) => unsafe { (*head.as_ptr()).addr },
            None => self.end,
        };
    }

    fn sbrk_locked(&mut self, delta: usize) -> Result<usize, ManagerError> {
        self.ensure_initialized()?;
        if delta == 0 {
            return Ok(self.brk);
        }
        if delta <= self.map - self.brk {
            let old = self.brk;
            self.brk += delta;
            Ok(old)
        } else {
            Err(ManagerError::out_of_memory(
                "sbrk request exceeds the unassigned space between brk and map",
            ))
        }
    }

    fn brk_locked(&mut self, addr: usize) -> Result<(), ManagerError> {
        self.ensure_initialized()?;
        if addr < self.start || addr >= self.map {
            return Err(ManagerError::invalid_parameter(
                "brk address must lie in [start, map)",
            ));
        }
        self.brk = addr;
        Ok(())
    }

    fn map_locked(
        &mut self,
        addr_hint: Option<usize>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<usize, ManagerError> {
        self.ensure_initialized()?;
        if addr_hint.is_some() {
            return Err(ManagerError::invalid_parameter(
                "fixed-address mapping is not supported; addr_hint must be None",
            ));
        }
        if length == 0 {
            return Err(ManagerError::invalid_parameter("length must be non-zero"));
        }
        let required_prot = ProtFlags::READ | ProtFlags::WRITE;
        if !prot.contains(required_prot) || prot.intersects(ProtFlags::EXECUTE) {
            return Err(ManagerError::invalid_parameter(
                "prot must include read and write and must not include execute",
            ));
        }
        let required_flags = MapFlags::ANONYMOUS | MapFlags::PRIVATE;
        let forbidden_flags = MapFlags::SHARED | MapFlags::FIXED;
        if !flags.contains(required_flags) || flags.intersects(forbidden_flags) {
            return Err(ManagerError::invalid_parameter(
                "flags must include anonymous and private and must not include shared or fixed",
            ));
        }

        let length = round_up_to_page(length);
        let gap = find_gap(&self.vad_list, self.brk, self.map, self.end, length, &mut self.coverage)?;
        let start = gap.start;

        self.apply_map(gap, length, prot, flags)?;
        self.resync_map();

        // SAFETY: `gap` was verified free and `[start, start+length)` lies
        // within `[base, end)`, memory this manager exclusively owns.
        unsafe {
            core::ptr::write_bytes(start as *mut u8, 0, length);
        }

        Ok(start)
    }

    /// Applies the three-way coalescing table from SPEC_FULL.md §4.4 to a
    /// gap already found by the gap finder.
    fn apply_map(&mut self, gap: Gap, length: usize, prot: ProtFlags, flags: MapFlags) -> Result<(), ManagerError> {
        let touches_left = gap
            .left
            .map(|l| unsafe { (*l.as_ptr()).addr + (*l.as_ptr()).size == gap.start })
            .unwrap_or(false);
        let touches_right = gap
            .right
            .map(|r| unsafe { gap.start + length == (*r.as_ptr()).addr })
            .unwrap_or(false);

        match (touches_left, touches_right) {
            (true, true) => {
                let left = gap.left.unwrap();
                let right = gap.right.unwrap();
                unsafe {
                    let right_size = (*right.as_ptr()).size;
                    (*left.as_ptr()).size += length + right_size;
                }
                self.vad_list.remove(right);
                self.pool.release(right);
                self.coverage.hit(index::MAP_COALESCE_BOTH);
            }
            (true, false) => {
                let left = gap.left.unwrap();
                unsafe {
                    (*left.as_ptr()).size += length;
                }
                self.coverage.hit(index::MAP_COALESCE_LEFT);
            }
            (false, true) => {
                let right = gap.right.unwrap();
                unsafe {
                    (*right.as_ptr()).addr = gap.start;
                    (*right.as_ptr()).size += length;
                }
                self.coverage.hit(index::MAP_COALESCE_RIGHT);
            }
            (false, false) => {
                let node = self
                    .pool
                    .obtain()
                    .ok_or_else(|| ManagerError::out_of_memory("descriptor pool exhausted"))?;
                unsafe {
                    let v = node.as_ptr();
                    (*v).addr = gap.start;
                    (*v).size = length;
                    (*v).prot = prot;
                    (*v).flags = flags;
                }
                // `gap.left` is always `None` here: the gap finder only ever
                // returns a `Some` left neighbor for an internal gap, and an
                // internal gap's start is by construction `left.end`, which
                // would have made `touches_left` true above. A fresh,
                // non-coalescing descriptor can only come from the grow-down
                // path, which always lands at the head of the list.
                self.coverage.hit(index::LIST_INSERT_AT_HEAD);
                self.vad_list.insert_after(gap.left, node);
                self.coverage.hit(index::LIST_INSERT_NEW_NO_COALESCE);
            }
        }
        Ok(())
    }

    fn unmap_locked(&mut self, addr: usize, length: usize) -> Result<(), ManagerError> {
        self.ensure_initialized()?;
        if addr == 0 || length == 0 {
            return Err(ManagerError::invalid_parameter(
                "addr and length must be non-zero",
            ));
        }
        if addr % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
            return Err(ManagerError::invalid_parameter(
                "addr and length must be page-aligned",
            ));
        }

        let node = self
            .vad_list
            .find_containing(addr)
            .ok_or_else(|| ManagerError::not_found("addr is not in any mapped region"))?;
        let (d_addr, d_size) = unsafe { ((*node.as_ptr()).addr, (*node.as_ptr()).size) };
        let s = addr;
        let e = addr
            .checked_add(length)
            .ok_or_else(|| ManagerError::invalid_parameter("addr + length overflows"))?;
        if e > d_addr + d_size {
            return Err(ManagerError::range_violation(
                "unmap range exceeds the descriptor addr falls within",
            ));
        }

        if s == d_addr && e == d_addr + d_size {
            self.vad_list.remove(node);
            self.pool.release(node);
            self.coverage.hit(index::UNMAP_FULL);
        } else if s == d_addr {
            unsafe {
                (*node.as_ptr()).addr += length;
                (*node.as_ptr()).size -= length;
            }
            self.coverage.hit(index::UNMAP_LEADING);
        } else if e == d_addr + d_size {
            unsafe {
                (*node.as_ptr()).size -= length;
            }
            self.coverage.hit(index::UNMAP_TRAILING);
        } else {
            let (prot, flags) = unsafe { ((*node.as_ptr()).prot, (*node.as_ptr()).flags) };
            let new_node = self
                .pool
                .obtain()
                .ok_or_else(|| ManagerError::out_of_memory("descriptor pool exhausted during split"))?;
            unsafe {
                (*node.as_ptr()).size = s - d_addr;
                let v = new_node.as_ptr();
                (*v).addr = e;
                (*v).size = (d_addr + d_size) - e;
                (*v).prot = prot;
                (*v).flags = flags;
            }
            self.vad_list.insert_after(Some(node), new_node);
            self.coverage.hit(index::LIST_INSERT_MID);
            self.coverage.hit(index::UNMAP_INTERIOR);
        }

        self.resync_map();

        if self.scrub {
            // SAFETY: `[s, s+length)` was just released and lies within the
            // memory this manager exclusively owns.
            unsafe {
                core::ptr::write_bytes(s as *mut u8, SCRUB_BYTE, length);
            }
        }

        Ok(())
    }

    fn remap_locked(
        &mut self,
        addr: usize,
        old_size: usize,
        new_size: usize,
        flags: RemapFlags,
    ) -> Result<usize, ManagerError> {
        self.ensure_initialized()?;
        if addr % PAGE_SIZE != 0 {
            return Err(ManagerError::invalid_parameter("addr must be page-aligned"));
        }
        if old_size == 0 || new_size == 0 {
            return Err(ManagerError::invalid_parameter("sizes must be non-zero"));
        }
        if flags != RemapFlags::MAY_MOVE {
            return Err(ManagerError::invalid_parameter(
                "flags must be exactly RemapFlags::MAY_MOVE",
            ));
        }

        let old_size = round_up_to_page(old_size);
        let new_size = round_up_to_page(new_size);

        let node = self
            .vad_list
            .find_containing(addr)
            .ok_or_else(|| ManagerError::not_found("addr is not in any mapped region"))?;
        let (d_addr, d_size, prot, mflags) = unsafe {
            let v = node.as_ptr();
            ((*v).addr, (*v).size, (*v).prot, (*v).flags)
        };
        let d_end = d_addr + d_size;
        if addr + old_size > d_end {
            return Err(ManagerError::range_violation(
                "remap range exceeds the descriptor addr falls within",
            ));
        }

        use core::cmp::Ordering;
        match new_size.cmp(&old_size) {
            Ordering::Equal => {
                self.coverage.hit(index::REMAP_SAME_SIZE);
                Ok(addr)
            }
            Ordering::Less => self.remap_shrink(node, addr, old_size, new_size, d_addr, d_end, prot, mflags),
            Ordering::Greater => self.remap_grow(node, addr, old_size, new_size, d_end, prot, mflags),
        }
    }

    fn remap_shrink(
        &mut self,
        node: NonNull<Vad>,
        addr: usize,
        old_size: usize,
        new_size: usize,
        d_addr: usize,
        d_end: usize,
        prot: ProtFlags,
        mflags: MapFlags,
    ) -> Result<usize, ManagerError> {
        if d_end != addr + old_size {
            let new_node = self.pool.obtain().ok_or_else(|| {
                ManagerError::out_of_memory("descriptor pool exhausted during remap split")
            })?;
            unsafe {
                let v = new_node.as_ptr();
                (*v).addr = addr + old_size;
                (*v).size = d_end - (addr + old_size);
                (*v).prot = prot;
                (*v).flags = mflags;
            }
            self.vad_list.insert_after(Some(node), new_node);
            self.coverage.hit(index::LIST_INSERT_MID);
            self.coverage.hit(index::REMAP_SHRINK_WITH_RESIDUAL);
        } else {
            self.coverage.hit(index::REMAP_SHRINK_EXACT);
        }

        unsafe {
            (*node.as_ptr()).size = (addr + new_size) - d_addr;
        }

        if self.scrub {
            unsafe {
                core::ptr::write_bytes((addr + new_size) as *mut u8, SCRUB_BYTE, old_size - new_size);
            }
        }

        self.resync_map();
        Ok(addr)
    }

    fn remap_grow(
        &mut self,
        node: NonNull<Vad>,
        addr: usize,
        old_size: usize,
        new_size: usize,
        d_end: usize,
        prot: ProtFlags,
        mflags: MapFlags,
    ) -> Result<usize, ManagerError> {
        let delta = new_size - old_size;
        let right_gap = self.vad_list.right_gap(node, self.end);

        if d_end == addr + old_size && right_gap >= delta {
            unsafe {
                (*node.as_ptr()).size += delta;
            }
            // SAFETY: the appended `[addr+old_size, addr+new_size)` was just
            // verified free (it's within the measured right gap).
            unsafe {
                core::ptr::write_bytes((addr + old_size) as *mut u8, 0, delta);
            }

            let next = unsafe { (*node.as_ptr()).next };
            if let Some(next_node) = next {
                let touches = unsafe {
                    (*node.as_ptr()).addr + (*node.as_ptr()).size == (*next_node.as_ptr()).addr
                };
                if touches {
                    unsafe {
                        let next_size = (*next_node.as_ptr()).size;
                        (*node.as_ptr()).size += next_size;
                    }
                    self.vad_list.remove(next_node);
                    self.pool.release(next_node);
                    self.coverage.hit(index::REMAP_GROW_IN_PLACE_COALESCE);
                } else {
                    self.coverage.hit(index::REMAP_GROW_IN_PLACE);
                }
            } else {
                self.coverage.hit(index::REMAP_GROW_IN_PLACE);
            }

            self.resync_map();
            Ok(addr)
        } else {
            self.coverage.hit(index::REMAP_GROW_BY_MOVING);
            let new_addr = self.map_locked(None, new_size, prot, mflags)?;
            // SAFETY: `new_addr`'s region was just mapped and is disjoint
            // from `[addr, addr+old_size)`, which is still live.
            unsafe {
                core::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, old_size);
            }
            if let Err(e) = self.unmap_locked(addr, old_size) {
                // Unwind the internal map so a failed remap leaks no memory
                // (SPEC_FULL.md §9 Open Questions).
                let _ = self.unmap_locked(new_addr, new_size);
                return Err(e);
            }
            Ok(new_addr)
        }
    }

    fn check_sanity(&self) -> Result<(), ManagerError> {
        self.ensure_initialized()?;

        if !(self.base <= self.start && self.start <= self.brk && self.brk <= self.map && self.map <= self.end) {
            return Err(ManagerError::unexpected(
                "region ordering invariant base<=start<=brk<=map<=end violated",
            ));
        }
        if self.end - self.base != self.size {
            return Err(ManagerError::unexpected("size != end - base"));
        }
        for addr in [self.start, self.brk, self.map, self.end] {
            if addr % PAGE_SIZE != 0 {
                return Err(ManagerError::unexpected("an internal boundary is not page-aligned"));
            }
        }

        match self.vad_list.head() {
            Some(head) => {
                if unsafe { (*head.as_ptr()).addr } != self.map {
                    return Err(ManagerError::unexpected(
                        "map does not equal the address of the VAD list's head",
                    ));
                }
            }
            None => {
                if self.map != self.end {
                    return Err(ManagerError::unexpected(
                        "map does not equal end while the VAD list is empty",
                    ));
                }
            }
        }

        let mut cur = self.vad_list.head();
        while let Some(node) = cur {
            let (addr, size, next) =
                unsafe { ((*node.as_ptr()).addr, (*node.as_ptr()).size, (*node.as_ptr()).next) };
            if size == 0 || addr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
                return Err(ManagerError::unexpected(
                    "a descriptor's addr/size is not a positive page multiple",
                ));
            }
            if addr < self.map || addr + size > self.end {
                return Err(ManagerError::unexpected("a descriptor escapes [map, end)"));
            }
            if let Some(next_node) = next {
                let next_addr = unsafe { (*next_node.as_ptr()).addr };
                if addr + size >= next_addr {
                    return Err(ManagerError::unexpected(
                        "two adjacent descriptors are contiguous or out of order",
                    ));
                }
            }
            cur = next;
        }

        Ok(())
    }
}
