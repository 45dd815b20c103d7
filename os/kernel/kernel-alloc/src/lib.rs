//! # Kernel Memory Core
//!
//! Physical frame allocation, virtual memory management and the kernel heap
//! of the 32-bit kernel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  KernelHeapAllocator  (#[global_allocator] adapter) │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ SpinLock::lock_irq
//! ┌─────────────────▼───────────────────────────────────┐
//! │  KernelMemory                                       │
//! │  ┌──────────────┐   HeapBacking   ┌──────────────┐  │
//! │  │ Heap         ├────────────────►│ Vmm          │  │
//! │  │ first-fit    │                 │ map / clone  │  │
//! │  │ grow/shrink  │                 │ page faults  │  │
//! │  └──────────────┘                 └──────┬───────┘  │
//! │                                FrameAlloc│          │
//! │                                   ┌──────▼───────┐  │
//! │                                   │ FrameStack   │  │
//! │                                   │ bump → stack │  │
//! │                                   └──────────────┘  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! - [`frame_alloc`]: bump allocation during boot, then an O(1) stack of free
//!   frames kept in the free frames themselves.
//! - [`vmm`]: two-level paging with a page-table window, demand paging for
//!   absence faults, eager address-space cloning.
//! - [`heap`]: in-band block headers addressed by offset, coalescing on free,
//!   growth and contraction at the tail.
//! - [`kernel_memory`]: the context value the boot code builds.
//! - [`global`]: `GlobalAlloc` on top of it.
//! - [`phys_mapper`]: physical memory access through the identity map.
//!
//! Every mutating operation runs with interrupts masked
//! ([`kernel_sync::IrqGuard`]).
//!
//! ## Usage
//! ```ignore
//! use kernel_alloc::{KernelMemory, phys_mapper::IdentityPhysMapper};
//! use kernel_vmem::X86Mmu;
//!
//! let mut memory = KernelMemory::boot(&IdentityPhysMapper, X86Mmu, &layout, &boot_info)?;
//! let p = memory.allocate(64, 0)?;
//! memory.free(p)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod kernel_memory;
pub mod phys_mapper;
pub mod vmm;

pub use frame_alloc::{FrameAllocError, FrameStack, FrameStackConfig};
pub use global::KernelHeapAllocator;
pub use heap::{Heap, HeapBacking, HeapError};
pub use kernel_memory::{BootError, KernelMemory};
pub use vmm::{FatalPageFault, PageFaultResolution, Vmm, VmmError};
