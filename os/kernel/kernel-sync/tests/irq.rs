use kernel_sync::irq::{cli_stop_interrupts, sti_enable_interrupts};
use kernel_sync::{IrqGuard, SpinLock, interrupts_enabled};

// The emulated interrupt flag is process-wide, so every scenario lives in
// one test function to keep them sequential.
#[test]
fn irq_masking_scenarios() {
    sti_enable_interrupts();
    assert!(interrupts_enabled());

    // guard masks and restores
    {
        let g = IrqGuard::new();
        assert!(g.restores_interrupts());
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    // nested guards: only the outer one re-enables
    {
        let _outer = IrqGuard::new();
        {
            let inner = IrqGuard::new();
            assert!(!inner.restores_interrupts());
        }
        assert!(!interrupts_enabled(), "inner guard must not re-enable");
    }
    assert!(interrupts_enabled());

    // a guard taken with interrupts already off leaves them off
    cli_stop_interrupts();
    {
        let _g = IrqGuard::new();
    }
    assert!(!interrupts_enabled());
    sti_enable_interrupts();

    // lock_irq masks for the guard's lifetime and releases the lock
    let lock = SpinLock::new(7_u32);
    {
        let mut g = lock.lock_irq();
        assert!(!interrupts_enabled());
        *g += 1;
        assert!(lock.try_lock().is_none());
    }
    assert!(interrupts_enabled());
    assert_eq!(*lock.lock(), 8);

    // try_lock_irq fails on a held lock and restores the flag
    let held = lock.lock();
    assert!(lock.try_lock_irq().is_none());
    assert!(interrupts_enabled());
    drop(held);
    assert!(lock.try_lock_irq().is_some());
    assert!(interrupts_enabled());
}
