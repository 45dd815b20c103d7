//! # Interrupt masking
//!
//! On a single-core kernel the only source of re-entrancy is an interrupt
//! handler, so "taking the lock" means clearing `EFLAGS.IF`. [`IrqGuard`]
//! saves the flag, disables interrupts and restores the saved state on drop.
//! Guards nest: only the outermost guard re-enables interrupts.
//!
//! On a 32-bit x86 target this uses `pushfd/pop`, `cli` and `sti`. On every
//! other target (host builds and tests) the interrupt flag is emulated with an
//! atomic so masking can be observed.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// `EFLAGS.IF`, bit 9.
const EFLAGS_IF: u32 = 1 << 9;

/// A spin lock guard that also disables interrupts while held.
///
/// Created via [`SpinLock::lock_irq`]; it
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying lock,
///
/// releasing them in reverse order on drop.
pub struct IrqSpinLockGuard<'a, T> {
    // Field order matters: the lock is released before interrupts come back.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    /// Acquires the lock with interrupts disabled for the guard’s lifetime.
    ///
    /// # Platform / Privilege
    ///
    /// Requires a privileged execution context where `cli/sti` are permitted.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Like [`lock_irq`](Self::lock_irq) but gives up if the lock is held.
    #[inline]
    pub fn try_lock_irq(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        let guard = self.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(target_arch = "x86")]
mod arch {
    #[inline]
    pub fn cli() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn sti() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn eflags() -> u32 {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }
}

#[cfg(not(target_arch = "x86"))]
mod arch {
    use super::EFLAGS_IF;
    use core::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn cli() {
        INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn sti() {
        INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn eflags() -> u32 {
        if INTERRUPTS_ENABLED.load(Ordering::SeqCst) {
            EFLAGS_IF
        } else {
            0
        }
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[inline]
pub fn cli_stop_interrupts() {
    arch::cli();
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[inline]
pub fn sti_enable_interrupts() {
    arch::sti();
}

/// Returns the current `EFLAGS` value (via `pushfd/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[inline]
#[must_use]
pub fn eflags() -> u32 {
    arch::eflags()
}

/// Whether `EFLAGS.IF` is currently set.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    eflags() & EFLAGS_IF != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were
/// previously enabled, preserving the original state.
///
/// # Examples
///
/// ```no_run
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// {
///     let _g = IrqGuard::new(); // interrupts disabled here
///     assert!(!interrupts_enabled());
/// }
/// // IF restored to prior state
/// ```
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
