//! kestrel-vmm: a KVM-backed hypervisor for 64-bit unikernel images.
//!
//! kestrel boots one specialized unikernel per process directly into long
//! mode, with no BIOS, no PCI, and no device model beyond a one-byte UART
//! sink and a tap-backed NIC hook. The guest requests host services through
//! a fixed set of paravirtual I/O ports whose argument structures live in
//! guest memory.
//!
//! # Architecture
//!
//! - [`config`] - environment-driven VM configuration
//! - [`memory`] - gap-aware guest RAM and guest page-table walks
//! - [`loader`] - unikernel ELF loading and boot parameters
//! - [`cpu`] - long-mode vCPU initialization and state capture/restore
//! - [`hypercall`] - paravirtual port numbers and argument layouts
//! - [`vcpu`] - the per-vCPU run loop and hypercall execution
//! - [`paging`] - guest page-table scanning for dumps
//! - [`checkpoint`] - on-disk checkpoint store
//! - [`migration`] - TCP migration transport and coordinator
//! - [`net`] - tap device backend and the inbound poll thread
//! - [`vm`] - VM context, bootstrap, and thread coordination

pub mod checkpoint;
pub mod config;
pub mod cpu;
pub mod hypercall;
pub mod loader;
pub mod memory;
pub mod migration;
pub mod net;
pub mod paging;
pub mod vcpu;
pub mod vm;

pub use config::VmConfig;
pub use vm::{Vm, VmError};
