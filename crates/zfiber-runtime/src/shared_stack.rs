//! Shared-stack arena
//!
//! A fixed set of physical stack buffers shared by a larger population of
//! fibers. A fiber bound to a shared buffer runs directly on it; when it
//! switches out, its live bytes (from its stack pointer up to the buffer's
//! high end) are copied to a per-fiber save area, and copied back in
//! before it next runs.
//!
//! The copies are performed by a trampoline running on a per-thread
//! switch stack, never on either fiber's own stack: restoring the
//! incoming fiber's bytes may overwrite the very frames the outgoing
//! fiber was executing on.

use crate::ctx::MachineContext;
use crate::current_arch;
use crate::fiber::Fiber;
use crate::stack::OwnedStack;
use crate::tls;
use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zfiber_core::SpinLock;

/// Size of the per-thread trampoline stack
const SWITCH_STACK_SIZE: usize = 64 * 1024;

/// Default size of each shared buffer
pub const DEFAULT_SHARED_STACK_SIZE: usize = 128 * 1024;

/// One physical shared stack
pub(crate) struct StackBuffer {
    mem: OwnedStack,

    /// Fiber whose live bytes are currently in the buffer; null when the
    /// last occupant has been saved out. The buffer outlives every
    /// occupant (arena-owned), so a raw back-pointer is sufficient; the
    /// occupant clears it on drop. A spinlock rather than a mutex: the
    /// trampoline takes it while running on the small per-thread switch
    /// stack, where parking machinery is unwelcome.
    occupant: SpinLock<*const Fiber>,
}

// The raw occupant pointer is only dereferenced under the buffer lock
// by the thread performing a switch.
unsafe impl Send for StackBuffer {}
unsafe impl Sync for StackBuffer {}

impl StackBuffer {
    #[inline]
    pub(crate) fn top(&self) -> *mut u8 {
        self.mem.top()
    }

    #[inline]
    pub(crate) fn bottom(&self) -> *mut u8 {
        self.mem.bottom()
    }
}

/// Arena of shared stack buffers, assigned to fibers round-robin
pub struct SharedStackArena {
    buffers: Vec<StackBuffer>,
    next: AtomicUsize,
    stack_size: usize,
}

impl SharedStackArena {
    /// Allocate `count` shared buffers of `stack_size` usable bytes each.
    ///
    /// # Panics
    ///
    /// Buffer allocation failure is fatal.
    pub fn new(count: usize, stack_size: usize) -> Arc<Self> {
        assert!(count > 0, "shared stack arena needs at least one buffer");
        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            let mem = OwnedStack::new(stack_size).unwrap_or_else(|e| {
                panic!("shared stack allocation failed: index={}, size={}: {}", i, stack_size, e)
            });
            buffers.push(StackBuffer {
                mem,
                occupant: SpinLock::new(ptr::null()),
            });
        }
        log::info!(
            "shared stack arena created: count={}, stack_size={}",
            count,
            stack_size
        );
        Arc::new(Self {
            buffers,
            next: AtomicUsize::new(0),
            stack_size,
        })
    }

    /// Number of physical buffers
    #[inline]
    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    /// Usable bytes per buffer
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Round-robin buffer assignment for a new fiber
    pub(crate) fn assign(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.buffers.len()
    }

    #[inline]
    pub(crate) fn buffer(&self, index: usize) -> &StackBuffer {
        &self.buffers[index]
    }
}

/// A fiber's binding to its shared buffer
pub(crate) struct SharedBinding {
    pub(crate) arena: Arc<SharedStackArena>,
    pub(crate) index: usize,

    /// Live stack bytes captured while the fiber is out of the buffer.
    /// Touched only by the thread switching the fiber in or out.
    pub(crate) save: UnsafeCell<Vec<u8>>,
}

impl SharedBinding {
    /// Drop any saved bytes and release the buffer if this fiber still
    /// occupies it (used by reset and drop).
    pub(crate) fn release(&self, owner: *const Fiber) {
        unsafe {
            (*self.save.get()).clear();
        }
        let buffer = self.arena.buffer(self.index);
        let mut occ = buffer.occupant.lock();
        if *occ == owner {
            *occ = ptr::null();
        }
    }
}

/// Per-thread trampoline stack for shared-stack swaps
pub(crate) struct SwitchStack {
    stack: OwnedStack,
    ctx: UnsafeCell<MachineContext>,
}

impl SwitchStack {
    pub(crate) fn new_boxed() -> Box<Self> {
        let stack = OwnedStack::new(SWITCH_STACK_SIZE)
            .unwrap_or_else(|e| panic!("switch stack allocation failed: {}", e));
        Box::new(Self {
            stack,
            ctx: UnsafeCell::new(MachineContext::zeroed()),
        })
    }
}

thread_local! {
    /// (from, to) of the swap in flight, handed to the trampoline
    static PENDING_SWAP: Cell<(*const Fiber, *const Fiber)> =
        const { Cell::new((ptr::null(), ptr::null())) };
}

/// Switch between two fibers when either side lives on a shared buffer.
///
/// The outgoing fiber's registers are saved by the jump onto the switch
/// stack; the trampoline then performs the stack copies and loads the
/// target context directly.
pub(crate) fn shared_switch(from: &Fiber, to: &Fiber) {
    let ss = tls::switch_stack();
    PENDING_SWAP.with(|p| p.set((from as *const Fiber, to as *const Fiber)));
    unsafe {
        let ssr = &*ss;
        // The switch context is throwaway; rebuild it for every swap.
        current_arch::init_context(
            ssr.ctx.get(),
            ssr.stack.top(),
            switch_trampoline as usize,
            0,
        );
        current_arch::context_switch(from.ctx_ptr(), ssr.ctx.get());
    }
    // Control returns here when `from` is eventually resumed.
}

/// Runs on the switch stack. Saves the outgoing fiber's live bytes,
/// evicts any unsaved previous occupant of the target buffer, restores
/// the target's bytes, and jumps to the target context.
extern "C" fn switch_trampoline(_arg: usize) {
    let (from, to) = PENDING_SWAP.with(|p| p.replace((ptr::null(), ptr::null())));
    debug_assert!(!from.is_null() && !to.is_null());

    unsafe {
        let from = &*from;
        let to = &*to;

        // Save the outgoing fiber. Its stack pointer was just recorded by
        // the context switch that brought us here. A terminated fiber has
        // no frames worth keeping; it only releases the buffer.
        if let Some(binding) = from.shared_binding() {
            let buffer = binding.arena.buffer(binding.index);
            let mut occ = buffer.occupant.lock();
            if *occ == from as *const Fiber {
                if !from.state().is_terminated() {
                    copy_out(from, binding, buffer);
                }
                *occ = ptr::null();
            }
        }

        // Bring the incoming fiber's bytes back into its buffer.
        if let Some(binding) = to.shared_binding() {
            let buffer = binding.arena.buffer(binding.index);
            let mut occ = buffer.occupant.lock();
            let prev = *occ;
            if prev != to as *const Fiber {
                if !prev.is_null() {
                    // The previous occupant suspended without being saved
                    // (it did not switch out through this path). Save it
                    // before its frames are overwritten.
                    let prev_fiber = &*prev;
                    if prev_fiber.state().can_yield() {
                        log::error!(
                            "shared stack buffer occupied by running fiber: id={}",
                            prev_fiber.id()
                        );
                    }
                    if let Some(prev_binding) = prev_fiber.shared_binding() {
                        if !prev_fiber.state().is_terminated() {
                            copy_out(prev_fiber, prev_binding, buffer);
                        }
                    }
                }
                let save = &*binding.save.get();
                if !save.is_empty() {
                    let dst = buffer.top().sub(save.len());
                    ptr::copy_nonoverlapping(save.as_ptr(), dst, save.len());
                }
                *occ = to as *const Fiber;
            }
        }

        current_arch::context_load(to.ctx_ptr());
    }
}

/// Copy a fiber's live bytes (saved stack pointer up to the buffer top)
/// into its save area.
unsafe fn copy_out(fiber: &Fiber, binding: &SharedBinding, buffer: &StackBuffer) {
    let sp = (*fiber.ctx_ptr()).stack_pointer();
    let top = buffer.top() as usize;
    let bottom = buffer.bottom() as usize;
    debug_assert!(
        sp >= bottom && sp <= top,
        "fiber stack pointer outside its shared buffer"
    );
    if sp < bottom || sp > top {
        log::error!(
            "refusing shared-stack save: sp={:#x} outside buffer [{:#x}, {:#x}]",
            sp,
            bottom,
            top
        );
        return;
    }
    let len = top - sp;
    let save = &mut *binding.save.get();
    save.clear();
    save.extend_from_slice(std::slice::from_raw_parts(sp as *const u8, len));
}
