//! # Kernel synchronization primitives
//!
//! The memory core runs on a single CPU; its critical sections are protected
//! by masking interrupts ([`IrqGuard`]). [`SpinLock`] adds mutual exclusion
//! for shared statics such as the global allocator, and
//! [`SpinLock::lock_irq`] combines both.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqSpinLockGuard, interrupts_enabled};
pub use spin_lock::{SpinLock, SpinLockGuard};
