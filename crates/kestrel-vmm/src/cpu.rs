//! Long-mode vCPU initialization and architectural state transfer.
//!
//! kestrel guests skip real mode entirely: every vCPU is born in 64-bit
//! long mode with a minimal GDT, identity-mapped boot page tables, and an
//! entry point taken straight from the image header. This module owns that
//! initial state, the CPUID and MSR programming that goes with it, and the
//! [`VcpuState`] record used to move a vCPU's complete architectural state
//! to disk (checkpoint) or across the wire (migration).
//!
//! # Boot register file
//!
//! All cores run the same startup code, so every core derives the same
//! `kvm_sregs` patch (GDT, page-table root, long-mode control bits) from
//! its machine defaults. Guest kernel entry is serialized by a counter in
//! the boot parameters, not by IPIs: core *i* spins until the counter
//! reaches *i*, then advertises itself.

use kvm_bindings::{
    kvm_fpu, kvm_lapic_state, kvm_mp_state, kvm_msr_entry, kvm_regs, kvm_segment, kvm_sregs,
    kvm_vcpu_events, kvm_xcrs, kvm_xsave, CpuId, Msrs, KVM_MAX_CPUID_ENTRIES,
    KVM_MP_STATE_RUNNABLE,
};
use kvm_ioctls::{Kvm, VcpuFd};
use log::debug;
use thiserror::Error;
use vm_memory::ByteValued;

use crate::loader::{BP_BOOT_COUNTER, BP_CURRENT_CORE};
use crate::memory::{GuestRam, MemoryError, PAGE_2M_SIZE};

// ═══════════════════════════════════════════════════════════════════════
//  Architectural constants
// ═══════════════════════════════════════════════════════════════════════

/// CR0: protected mode enable.
pub const X86_CR0_PE: u64 = 1 << 0;
/// CR0: paging enable.
pub const X86_CR0_PG: u64 = 1 << 31;
/// CR4: physical address extensions.
pub const X86_CR4_PAE: u64 = 1 << 5;
/// EFER: long mode enable.
pub const EFER_LME: u64 = 1 << 8;
/// EFER: long mode active.
pub const EFER_LMA: u64 = 1 << 10;

/// Guest-physical address of the boot GDT.
pub const BOOT_GDT: u64 = 0x1000;
/// Guest-physical address of the boot PML4.
pub const BOOT_PML4: u64 = 0x10000;
/// Guest-physical address of the boot PDPTE page.
pub const BOOT_PDPTE: u64 = 0x11000;
/// Guest-physical address of the boot page directory.
pub const BOOT_PDE: u64 = 0x12000;

/// GDT slot of the null descriptor.
pub const BOOT_GDT_NULL: u8 = 0;
/// GDT slot of the 64-bit code segment.
pub const BOOT_GDT_CODE: u8 = 1;
/// GDT slot of the data segment.
pub const BOOT_GDT_DATA: u8 = 2;
/// Number of boot GDT entries.
pub const BOOT_GDT_MAX: usize = 3;

/// Access/flags word of the 64-bit code descriptor.
pub const GDT_FLAGS_CODE64: u16 = 0xA09B;
/// Access/flags word of the data descriptor.
pub const GDT_FLAGS_DATA: u16 = 0xC093;

/// The boot tables identity-map this much of guest memory with 2 MiB
/// pages; the guest installs its own hierarchy before touching more.
pub const BOOT_IDENTITY_MAP: u64 = 0x2000_0000;

/// Reset value of the local APIC base.
pub const APIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

/// CPUID leaf for architectural performance monitoring.
const CPUID_FUNC_PERFMON: u32 = 0x0A;

// ─── Model-specific register indices ────────────────────────────────────

pub const MSR_IA32_TSC: u32 = 0x0000_0010;
pub const MSR_IA32_APICBASE: u32 = 0x0000_001B;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01A0;
pub const MSR_IA32_CR_PAT: u32 = 0x0000_0277;
pub const MSR_EFER: u32 = 0xC000_0080;
pub const MSR_STAR: u32 = 0xC000_0081;
pub const MSR_LSTAR: u32 = 0xC000_0082;
pub const MSR_CSTAR: u32 = 0xC000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xC000_0084;
pub const MSR_FS_BASE: u32 = 0xC000_0100;
pub const MSR_GS_BASE: u32 = 0xC000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// Capacity of the serialized MSR bundle.
pub const MAX_MSR_ENTRIES: usize = 25;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from vCPU state programming.
#[derive(Error, Debug)]
pub enum CpuError {
    #[error("failed to get supported CPUID: {0}")]
    GetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to read vCPU state ({what}): {source}")]
    Get {
        what: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("failed to write vCPU state ({what}): {source}")]
    Set {
        what: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("MSR bundle truncated: transferred {got} of {want}")]
    MsrCount { got: usize, want: usize },

    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),
}

// ═══════════════════════════════════════════════════════════════════════
//  GDT helpers
// ═══════════════════════════════════════════════════════════════════════

/// Construct a raw 8-byte GDT descriptor from flags, base, and limit.
///
/// `flags[7:0]` is the access byte (descriptor byte 5) and `flags[15:12]`
/// the flags nibble (granularity, D/B, L, AVL).
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xFF00_0000) << 32)
        | ((u64::from(base) & 0x00FF_FFFF) << 16)
        | (u64::from(limit) & 0x0000_FFFF)
        | ((u64::from(limit) & 0x000F_0000) << 32)
        | ((u64::from(flags) & 0x0000_F0FF) << 40)
}

fn get_base(entry: u64) -> u64 {
    ((entry >> 32) & 0xFF00_0000) | ((entry >> 16) & 0x00FF_FFFF)
}

fn get_limit(entry: u64) -> u32 {
    let limit = (((entry >> 32) & 0x000F_0000) | (entry & 0xFFFF)) as u32;
    // Granularity set scales the 20-bit limit to 4 KiB units.
    if get_g(entry) == 1 {
        (limit << 12) | 0xFFF
    } else {
        limit
    }
}

fn get_g(entry: u64) -> u8 {
    ((entry >> 55) & 1) as u8
}

fn get_db(entry: u64) -> u8 {
    ((entry >> 54) & 1) as u8
}

fn get_l(entry: u64) -> u8 {
    ((entry >> 53) & 1) as u8
}

fn get_avl(entry: u64) -> u8 {
    ((entry >> 52) & 1) as u8
}

fn get_p(entry: u64) -> u8 {
    ((entry >> 47) & 1) as u8
}

fn get_dpl(entry: u64) -> u8 {
    ((entry >> 45) & 0x3) as u8
}

fn get_s(entry: u64) -> u8 {
    ((entry >> 44) & 1) as u8
}

fn get_type(entry: u64) -> u8 {
    ((entry >> 40) & 0xF) as u8
}

/// Decode a GDT descriptor into the KVM segment register format.
///
/// `table_index` is the GDT slot, which fixes the selector.
pub fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: get_base(entry),
        limit: get_limit(entry),
        selector: u16::from(table_index) * 8,
        type_: get_type(entry),
        present: get_p(entry),
        dpl: get_dpl(entry),
        db: get_db(entry),
        s: get_s(entry),
        l: get_l(entry),
        g: get_g(entry),
        avl: get_avl(entry),
        padding: 0,
        unusable: u8::from(get_p(entry) == 0),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  CPUID
// ═══════════════════════════════════════════════════════════════════════

/// Adjust the host-supported CPUID table for a kestrel guest.
///
/// The guest must see the hypervisor bit and MSR support; TSC-deadline is
/// advertised only when the host irqchip can deliver it; the performance
/// monitoring leaf is zeroed because no PMU is virtualized.
pub fn filter_cpuid(cpuid: &mut CpuId, tsc_deadline: bool) {
    for entry in cpuid.as_mut_slice() {
        match entry.function {
            1 => {
                entry.ecx |= 1 << 31;
                if tsc_deadline {
                    entry.ecx |= 1 << 24;
                }
                entry.edx |= 1 << 5;
            }
            CPUID_FUNC_PERFMON => {
                entry.eax = 0;
            }
            _ => {}
        }
    }
}

/// Program a vCPU's CPUID from the filtered host table.
pub fn setup_cpuid(kvm: &Kvm, vcpu: &VcpuFd, tsc_deadline: bool) -> Result<(), CpuError> {
    let mut cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(CpuError::GetCpuid)?;
    filter_cpuid(&mut cpuid, tsc_deadline);
    vcpu.set_cpuid2(&cpuid).map_err(CpuError::SetCpuid)
}

// ═══════════════════════════════════════════════════════════════════════
//  Boot state
// ═══════════════════════════════════════════════════════════════════════

/// Write the boot GDT and the identity-mapped page tables into guest
/// memory. Called once, before any vCPU runs.
pub fn setup_boot_tables(ram: &GuestRam) -> Result<(), MemoryError> {
    // GDT: null, 64-bit code, data.
    ram.write_u64(BOOT_GDT, gdt_entry(0, 0, 0))?;
    ram.write_u64(BOOT_GDT + 8, gdt_entry(GDT_FLAGS_CODE64, 0, 0xFFFFF))?;
    ram.write_u64(BOOT_GDT + 16, gdt_entry(GDT_FLAGS_DATA, 0, 0xFFFFF))?;

    // One PML4 entry, one PDPTE entry, then 2 MiB mappings covering the
    // first 512 MiB.
    use crate::memory::{PG_PRESENT, PG_PSE, PG_RW};
    ram.write_u64(BOOT_PML4, BOOT_PDPTE | PG_PRESENT | PG_RW)?;
    ram.write_u64(BOOT_PDPTE, BOOT_PDE | PG_PRESENT | PG_RW)?;
    let mut paddr = 0;
    let mut slot = BOOT_PDE;
    while paddr < BOOT_IDENTITY_MAP {
        ram.write_u64(slot, paddr | PG_PRESENT | PG_RW | PG_PSE)?;
        paddr += PAGE_2M_SIZE;
        slot += 8;
    }

    Ok(())
}

/// Patch a machine-default `kvm_sregs` into the long-mode boot template:
/// boot GDT, identity page tables, and the control bits for protected
/// mode, PAE, paging, and long mode.
pub fn apply_boot_sregs(sregs: &mut kvm_sregs) {
    let code = kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_CODE64, 0, 0xFFFFF), BOOT_GDT_CODE);
    let data = kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_DATA, 0, 0xFFFFF), BOOT_GDT_DATA);

    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;

    sregs.gdt.base = BOOT_GDT;
    sregs.gdt.limit = (8 * BOOT_GDT_MAX as u16) - 1;

    sregs.cr3 = BOOT_PML4;
    sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
    sregs.cr4 |= X86_CR4_PAE;
    sregs.efer |= EFER_LME | EFER_LMA;
}

/// Boot register file: execution starts at the image entry with the
/// architecturally required reserved flag bit set.
pub fn boot_regs(entry: u64) -> kvm_regs {
    kvm_regs {
        rip: entry,
        rflags: 0x2,
        ..Default::default()
    }
}

/// Serialize guest kernel entry across cores.
///
/// Core `id` spins until its predecessor has bumped the boot counter,
/// then writes its own id into the advertised slot. The counter lives in
/// the boot-parameter block and is incremented by the guest itself.
///
/// Returns `false` without advertising when `cancelled` turns true, so a
/// VM shutting down before all cores booted does not strand the spinner.
pub fn wait_for_boot_turn(
    ram: &GuestRam,
    boot_base: u64,
    id: u32,
    cancelled: impl Fn() -> bool,
) -> Result<bool, MemoryError> {
    loop {
        let mut word = [0u8; 4];
        ram.read_bytes(boot_base + BP_BOOT_COUNTER, &mut word)?;
        if u32::from_le_bytes(word) >= id {
            break;
        }
        if cancelled() {
            return Ok(false);
        }
        std::thread::yield_now();
    }
    ram.write_bytes(boot_base + BP_CURRENT_CORE, &id.to_le_bytes())?;
    Ok(true)
}

// ═══════════════════════════════════════════════════════════════════════
//  Serializable vCPU state
// ═══════════════════════════════════════════════════════════════════════

/// Fixed-layout MSR bundle: a `kvm_msrs` header with an inline entry
/// array, so the whole record is plain bytes.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct MsrData {
    pub nmsrs: u32,
    pad: u32,
    pub entries: [kvm_msr_entry; MAX_MSR_ENTRIES],
}

/// XSAVE area as a plain array (the raw kvm type drags in a flexible
/// array member that cannot be serialized by value).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct XsaveArea {
    pub region: [u32; 1024],
}

impl Default for XsaveArea {
    fn default() -> Self {
        Self { region: [0; 1024] }
    }
}

/// The complete architectural state of one vCPU.
///
/// This is the unit of checkpoint files and the migration wire format;
/// layout changes break both. Valid for restore only while guest memory is
/// bit-identical to its state at save time.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct VcpuState {
    pub msr_data: MsrData,
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub fpu: kvm_fpu,
    pub lapic: kvm_lapic_state,
    pub xsave: XsaveArea,
    pub xcrs: kvm_xcrs,
    pub events: kvm_vcpu_events,
    pub mp_state: kvm_mp_state,
    pad: u32,
}

// Plain-old-data: every member is a fixed-size register dump with no
// pointers; explicit padding keeps the byte view fully initialized.
unsafe impl ByteValued for VcpuState {}

/// Indices of the MSRs captured in a [`VcpuState`].
pub fn saved_msr_indices() -> [u32; 15] {
    [
        MSR_IA32_APICBASE,
        MSR_IA32_SYSENTER_CS,
        MSR_IA32_SYSENTER_ESP,
        MSR_IA32_SYSENTER_EIP,
        MSR_IA32_CR_PAT,
        MSR_IA32_MISC_ENABLE,
        MSR_IA32_TSC,
        MSR_CSTAR,
        MSR_STAR,
        MSR_EFER,
        MSR_LSTAR,
        MSR_GS_BASE,
        MSR_FS_BASE,
        MSR_KERNEL_GS_BASE,
        MSR_SYSCALL_MASK,
    ]
}

/// Capture the complete architectural state of a vCPU.
///
/// Must run on a quiesced guest, from the thread owning the vCPU.
pub fn save_vcpu_state(vcpu: &VcpuFd) -> Result<VcpuState, CpuError> {
    let mut state = VcpuState::default();

    let indices = saved_msr_indices();
    let entries: Vec<kvm_msr_entry> = indices
        .iter()
        .map(|&index| kvm_msr_entry {
            index,
            ..Default::default()
        })
        .collect();
    let mut msrs = Msrs::from_entries(&entries).expect("MSR list fits the bundle");
    let transferred = vcpu
        .get_msrs(&mut msrs)
        .map_err(|e| CpuError::Get { what: "MSRs", source: e })?;
    if transferred != indices.len() {
        return Err(CpuError::MsrCount {
            got: transferred,
            want: indices.len(),
        });
    }
    state.msr_data.nmsrs = indices.len() as u32;
    state.msr_data.entries[..indices.len()].copy_from_slice(msrs.as_slice());

    state.sregs = vcpu
        .get_sregs()
        .map_err(|e| CpuError::Get { what: "sregs", source: e })?;
    state.regs = vcpu
        .get_regs()
        .map_err(|e| CpuError::Get { what: "regs", source: e })?;
    state.xcrs = vcpu
        .get_xcrs()
        .map_err(|e| CpuError::Get { what: "XCRs", source: e })?;
    state.lapic = vcpu
        .get_lapic()
        .map_err(|e| CpuError::Get { what: "LAPIC", source: e })?;
    state.fpu = vcpu
        .get_fpu()
        .map_err(|e| CpuError::Get { what: "FPU", source: e })?;
    let xsave = vcpu
        .get_xsave()
        .map_err(|e| CpuError::Get { what: "XSAVE", source: e })?;
    state.xsave.region.copy_from_slice(&xsave.region);
    state.events = vcpu
        .get_vcpu_events()
        .map_err(|e| CpuError::Get { what: "events", source: e })?;
    state.mp_state = vcpu
        .get_mp_state()
        .map_err(|e| CpuError::Get { what: "MP state", source: e })?;

    Ok(state)
}

/// Restore a vCPU from a previously captured state record.
///
/// The MP state is forced runnable and the APIC base and CPUID are
/// reprogrammed first; the record is then applied in dependency order:
/// sregs, regs, MSRs, XCRs, MP, LAPIC, FPU, XSAVE, events.
pub fn restore_vcpu_state(
    kvm: &Kvm,
    vcpu: &VcpuFd,
    state: &VcpuState,
    tsc_deadline: bool,
) -> Result<(), CpuError> {
    let mut state = *state;
    state.mp_state.mp_state = KVM_MP_STATE_RUNNABLE;

    setup_cpuid(kvm, vcpu, tsc_deadline)?;

    vcpu.set_sregs(&state.sregs)
        .map_err(|e| CpuError::Set { what: "sregs", source: e })?;
    vcpu.set_regs(&state.regs)
        .map_err(|e| CpuError::Set { what: "regs", source: e })?;

    // Clamp against corrupt records; the bundle never legitimately holds
    // more than its capacity.
    let nmsrs = (state.msr_data.nmsrs as usize).min(MAX_MSR_ENTRIES);
    let msrs = Msrs::from_entries(&state.msr_data.entries[..nmsrs])
        .expect("MSR bundle fits the wrapper");
    let transferred = vcpu
        .set_msrs(&msrs)
        .map_err(|e| CpuError::Set { what: "MSRs", source: e })?;
    if transferred != nmsrs {
        return Err(CpuError::MsrCount {
            got: transferred,
            want: nmsrs,
        });
    }

    vcpu.set_xcrs(&state.xcrs)
        .map_err(|e| CpuError::Set { what: "XCRs", source: e })?;
    vcpu.set_mp_state(state.mp_state)
        .map_err(|e| CpuError::Set { what: "MP state", source: e })?;
    vcpu.set_lapic(&state.lapic)
        .map_err(|e| CpuError::Set { what: "LAPIC", source: e })?;
    vcpu.set_fpu(&state.fpu)
        .map_err(|e| CpuError::Set { what: "FPU", source: e })?;

    let mut xsave = kvm_xsave::default();
    xsave.region.copy_from_slice(&state.xsave.region);
    vcpu.set_xsave(&xsave)
        .map_err(|e| CpuError::Set { what: "XSAVE", source: e })?;

    vcpu.set_vcpu_events(&state.events)
        .map_err(|e| CpuError::Set { what: "events", source: e })?;

    debug!("vCPU state restored, rip {:#x}", state.regs.rip);
    Ok(())
}

/// First half of the boot path: runnable MP state, CPUID programmed,
/// fast strings enabled. Safe to run before the boot handshake.
pub fn prepare_vcpu_boot(kvm: &Kvm, vcpu: &VcpuFd, tsc_deadline: bool) -> Result<(), CpuError> {
    setup_cpuid(kvm, vcpu, tsc_deadline)?;

    vcpu.set_mp_state(kvm_mp_state {
        mp_state: KVM_MP_STATE_RUNNABLE,
    })
    .map_err(|e| CpuError::Set { what: "MP state", source: e })?;

    // MISC_ENABLE bit 0 turns on fast string operations.
    let msrs = Msrs::from_entries(&[kvm_msr_entry {
        index: MSR_IA32_MISC_ENABLE,
        data: 1,
        ..Default::default()
    }])
    .expect("single-entry MSR list");
    vcpu.set_msrs(&msrs)
        .map_err(|e| CpuError::Set { what: "MSRs", source: e })?;

    Ok(())
}

/// Second half of the boot path, after the handshake released this core:
/// load the long-mode segment/control template and point execution at
/// the image entry.
pub fn enter_long_mode(vcpu: &VcpuFd, entry: u64) -> Result<(), CpuError> {
    let mut sregs = vcpu
        .get_sregs()
        .map_err(|e| CpuError::Get { what: "sregs", source: e })?;
    apply_boot_sregs(&mut sregs);
    vcpu.set_sregs(&sregs)
        .map_err(|e| CpuError::Set { what: "sregs", source: e })?;
    vcpu.set_regs(&boot_regs(entry))
        .map_err(|e| CpuError::Set { what: "regs", source: e })?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Register dump
// ═══════════════════════════════════════════════════════════════════════

fn show_segment(name: &str, seg: &kvm_segment) {
    eprintln!(
        " {name}       {:04x}      {:016x}  {:08x}  {:02x}    {} {}   {}  {} {} {} {}",
        seg.selector, seg.base, seg.limit, seg.type_, seg.present, seg.dpl, seg.db, seg.s, seg.l,
        seg.g, seg.avl,
    );
}

/// Dump the register file of a vCPU to stderr, for fatal-error reports.
pub fn dump_registers(vcpu: &VcpuFd, id: u32) {
    let (regs, sregs) = match (vcpu.get_regs(), vcpu.get_sregs()) {
        (Ok(r), Ok(s)) => (r, s),
        _ => {
            eprintln!(" unable to read registers of CPU {id}");
            return;
        }
    };

    eprintln!("\n Dump state of CPU {id}");
    eprintln!("\n Registers:");
    eprintln!(" ----------");
    eprintln!(
        " rip: {:016x}   rsp: {:016x} flags: {:016x}",
        regs.rip, regs.rsp, regs.rflags
    );
    eprintln!(
        " rax: {:016x}   rbx: {:016x}   rcx: {:016x}",
        regs.rax, regs.rbx, regs.rcx
    );
    eprintln!(
        " rdx: {:016x}   rsi: {:016x}   rdi: {:016x}",
        regs.rdx, regs.rsi, regs.rdi
    );
    eprintln!(
        " rbp: {:016x}    r8: {:016x}    r9: {:016x}",
        regs.rbp, regs.r8, regs.r9
    );
    eprintln!(
        " r10: {:016x}   r11: {:016x}   r12: {:016x}",
        regs.r10, regs.r11, regs.r12
    );
    eprintln!(
        " r13: {:016x}   r14: {:016x}   r15: {:016x}",
        regs.r13, regs.r14, regs.r15
    );
    eprintln!(
        " cr0: {:016x}   cr2: {:016x}   cr3: {:016x}",
        sregs.cr0, sregs.cr2, sregs.cr3
    );
    eprintln!(" cr4: {:016x}   cr8: {:016x}", sregs.cr4, sregs.cr8);
    eprintln!("\n Segment registers:");
    eprintln!(" ------------------");
    eprintln!(" register  selector  base              limit     type  p dpl db s l g avl");
    show_segment("cs ", &sregs.cs);
    show_segment("ss ", &sregs.ss);
    show_segment("ds ", &sregs.ds);
    show_segment("es ", &sregs.es);
    show_segment("fs ", &sregs.fs);
    show_segment("gs ", &sregs.gs);
    show_segment("tr ", &sregs.tr);
    show_segment("ldt", &sregs.ldt);
    eprintln!(
        " gdt                 {:016x}  {:08x}",
        sregs.gdt.base, sregs.gdt.limit
    );
    eprintln!(
        " idt                 {:016x}  {:08x}",
        sregs.idt.base, sregs.idt.limit
    );
    eprintln!(
        "\n efer: {:016x}  apic base: {:016x}",
        sregs.efer, sregs.apic_base
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
