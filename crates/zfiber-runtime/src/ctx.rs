//! Machine context: the register snapshot taken at a suspension point
//!
//! Only callee-saved state is captured. Caller-saved registers are dead
//! across the `context_switch` call by the C calling convention, so a
//! voluntary switch never needs them.

/// Saved register file for x86_64 (System V AMD64)
///
/// Callee-saved: rbx, rbp, r12-r15, plus rsp and the resume address.
/// The layout is fixed; the assembly in `arch::x86_64` addresses fields
/// by byte offset.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MachineContext {
    pub rbx: u64, // 0x00
    pub rbp: u64, // 0x08
    pub r12: u64, // 0x10
    pub r13: u64, // 0x18
    pub r14: u64, // 0x20
    pub r15: u64, // 0x28
    pub rsp: u64, // 0x30
    pub rip: u64, // 0x38
}

/// Saved register file for aarch64 (AAPCS64)
///
/// Callee-saved: x19-x28, fp (x29), lr (x30), sp and the low 64 bits of
/// d8-d15. The layout is fixed; the assembly in `arch::aarch64` addresses
/// fields by byte offset.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MachineContext {
    pub x19: u64, // 0x00
    pub x20: u64, // 0x08
    pub x21: u64, // 0x10
    pub x22: u64, // 0x18
    pub x23: u64, // 0x20
    pub x24: u64, // 0x28
    pub x25: u64, // 0x30
    pub x26: u64, // 0x38
    pub x27: u64, // 0x40
    pub x28: u64, // 0x48
    pub fp: u64,  // 0x50 (x29)
    pub lr: u64,  // 0x58 (x30) - resume address
    pub sp: u64,  // 0x60
    pub d8: u64,  // 0x68
    pub d9: u64,  // 0x70
    pub d10: u64, // 0x78
    pub d11: u64, // 0x80
    pub d12: u64, // 0x88
    pub d13: u64, // 0x90
    pub d14: u64, // 0x98
    pub d15: u64, // 0xa0
}

impl MachineContext {
    /// A zeroed context; filled in by `arch::init_context` or by the
    /// first switch away from it
    pub fn zeroed() -> Self {
        Self::default()
    }

    /// The saved stack pointer
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            self.rsp as usize
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.sp as usize
        }
    }
}
