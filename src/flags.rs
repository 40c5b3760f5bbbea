//! Protection and mapping flag sets (SPEC_FULL.md §6).
//!
//! These bits are validated and stored but never pushed down to hardware
//! page tables — protection enforcement is out of scope for this manager.

use bitflags::bitflags;

bitflags! {
    /// Memory protection bits recognized by `map`/`remap`.
    ///
    /// `map` requires `READ | WRITE` set and `EXECUTE` clear.
    pub struct ProtFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags recognized by `map`.
    ///
    /// `map` requires `ANONYMOUS | PRIVATE` set and `SHARED | FIXED` clear:
    /// fixed-address and file/shared mappings are not supported.
    pub struct MapFlags: u32 {
        const ANONYMOUS = 1 << 0;
        const PRIVATE   = 1 << 1;
        const SHARED    = 1 << 2;
        const FIXED     = 1 << 3;
    }
}

bitflags! {
    /// Flags accepted by `remap`. The only legal value is `MAY_MOVE`; `remap`
    /// rejects anything else, including the empty set.
    pub struct RemapFlags: u32 {
        const MAY_MOVE = 1 << 0;
    }
}
