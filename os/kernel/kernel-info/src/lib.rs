//! # Kernel Configuration and Boot Interface
//!
//! This crate is the single source of truth for the memory layout of the
//! 32-bit kernel and for the data the boot code hands to the memory core.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Compile-time constants (page size, identity map, kernel heap geometry,
//! page-table window addresses) checked with `const` assertions, plus the
//! runtime [`KernelLayout`](memory::KernelLayout) built from them.
//!
//! ### Boot Information ([`boot`])
//! The boot loader's physical memory map ([`MemoryRegion`](boot::MemoryRegion),
//! type `1` is usable RAM) and the placement address past the kernel image.
//!
//! ## Virtual Address Space
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity map (kernel image,    │
//!             │  boot structures, managed RAM)  │
//! 0x0100_0000 ├─────────────────────────────────┤ IDENTITY_MAP_END
//!             │  Process space / demand-paged   │
//!             │  regions                        │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_HEAP_START
//!             │  Kernel heap (grows upwards)    │
//! 0xCFFF_F000 ├─────────────────────────────────┤ KERNEL_HEAP_MAX
//!             │  Unused                         │
//! 0xFF80_0000 ├─────────────────────────────────┤ WINDOW_RESERVED_START
//!             │  Window table (directory at     │
//!             │  0xFFBF_F000)                   │
//! 0xFFC0_0000 ├─────────────────────────────────┤ PAGE_TABLE_WINDOW
//!             │  All page tables, directory at  │
//!             │  0xFFFF_F000                    │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
