//! Architecture-specific context switching
//!
//! Each backend provides the same three primitives:
//!
//! - `init_context` - set up a fresh context so that switching to it
//!   enters the fiber trampoline with an entry function and argument
//! - `context_switch` - save the current callee-saved state and resume
//!   another context
//! - `context_load` - resume another context without saving anything
//!   (used from the shared-stack switch trampoline, whose own context is
//!   throwaway)

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;
