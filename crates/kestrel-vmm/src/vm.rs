//! VM context, bootstrap, and thread coordination.
//!
//! [`Vm`] owns all VM-wide state: the KVM handles, guest RAM,
//! configuration, barriers, and per-vCPU bookkeeping, grouped into one
//! [`VmShared`] value handed to every thread. Per-vCPU state lives in the
//! [`Vcpu`] handle owned by its thread, not in thread-local mutables.
//!
//! # Startup paths
//!
//! 1. **Migration responder** (`KESTREL_MIGRATION_SERVER`): listen on the
//!    migration port, receive metadata, memory, vCPU states, and the
//!    clock, then enter the run loop from the restored state.
//! 2. **Checkpoint restart** (a `checkpoint/chk_config.txt` exists):
//!    replay the checkpoint set into fresh RAM and restore each vCPU from
//!    its state file.
//! 3. **Fresh boot**: load the unikernel image and start vCPU 0 at its
//!    entry point.
//!
//! # Coordination
//!
//! Checkpoint and migration interrupt the vCPUs cooperatively: the
//! coordinator publishes a [`VmEvent`], kicks every vCPU thread with a
//! real-time signal (whose handler only flips KVM's immediate-exit flag),
//! and meets them at a rendezvous barrier. The barriers guarantee that
//! every vCPU has saved its state before any memory scan begins, and that
//! no vCPU resumes before the dump is complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kvm_bindings::{
    kvm_enable_cap, kvm_irqchip, kvm_userspace_memory_region, KVM_CAP_X2APIC_API,
    KVM_CLOCK_TSC_STABLE, KVM_IRQCHIP_IOAPIC, KVM_MEM_LOG_DIRTY_PAGES,
    KVM_X2APIC_API_DISABLE_BROADCAST_QUIRK, KVM_X2APIC_API_USE_32BIT_IDS,
};
use kvm_ioctls::{Cap, Kvm, VmFd};
use log::{info, warn};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::signal::register_signal_handler;

use crate::checkpoint::{self, CheckpointError, GuestClock, Manifest, CHECKPOINT_DIR};
use crate::config::VmConfig;
use crate::cpu::{CpuError, VcpuState};
use crate::hypercall::{UnknownPort, NET_IRQ};
use crate::loader::{self, LoadError};
use crate::memory::{GuestRam, MemoryError};
use crate::migration::{
    self, transport::MigrationStream, transport::MIGRATION_PORT, MemRegion, MigrationError,
    MigrationMetadata, MigrationParams, MigrationParamsWire, MigrationType, MIG_ITERS,
};
use crate::net::{NetError, Semaphore, TapDevice};
use crate::paging::{self, PageSelector};
use crate::vcpu::{collect_forwarded_cmdline, kick_handler, kick_signal, ForwardedCmdline, Vcpu};

/// Use KVM's dirty-page logging instead of guest page-table scans for
/// incremental dumps. Build-time switch; the slots must be registered
/// with logging enabled for the bitmap backend to see anything.
const USE_DIRTY_LOG: bool = false;

/// KVM API version this hypervisor is written against.
const KVM_API_VERSION: i32 = 12;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Top-level error of the hypervisor.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("KVM call {what} failed: {source}")]
    Kvm {
        what: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("KVM API version mismatch: host has {0}, kestrel requires {KVM_API_VERSION}")]
    ApiVersion(i32),

    #[error("host lacks a required KVM capability: {0}")]
    MissingCapability(&'static str),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    UnknownPort(#[from] UnknownPort),

    #[error("fatal guest condition: {0}")]
    FatalGuest(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ═══════════════════════════════════════════════════════════════════════
//  Coordination events
// ═══════════════════════════════════════════════════════════════════════

/// Cross-vCPU coordination event, checked between run-loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmEvent {
    None = 0,
    Checkpoint = 1,
    Migration = 2,
    Shutdown = 3,
}

impl VmEvent {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => VmEvent::Checkpoint,
            2 => VmEvent::Migration,
            3 => VmEvent::Shutdown,
            _ => VmEvent::None,
        }
    }
}

/// Tap backend plus the machinery of the inbound poll thread.
pub struct NetState {
    pub tap: TapDevice,
    pub irq: EventFd,
    pub drained: Semaphore,
    poll_started: AtomicBool,
}

/// Checkpoint directory and round counter.
struct CheckpointRound {
    dir: PathBuf,
    next: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared VM state
// ═══════════════════════════════════════════════════════════════════════

/// Everything shared between the main thread, the vCPU threads, and the
/// coordinator threads. Immutable after construction except through the
/// explicit synchronization primitives.
pub struct VmShared {
    pub kvm: Kvm,
    pub vm: VmFd,
    pub ram: GuestRam,
    pub config: VmConfig,
    /// Guest-physical entry point of the image.
    pub entry: u64,
    /// Base of the boot-parameter block.
    pub boot_base: u64,
    pub tsc_deadline: bool,
    pub stable_clock: bool,
    pub forward: ForwardedCmdline,
    pub net: Option<NetState>,

    /// All-vCPU quiesce barrier (checkpoint, size ncores + 1).
    pub chk_barrier: Barrier,
    /// vCPU-only quiesce barrier (migration, size ncores).
    pub vcpu_quiesce: Barrier,
    /// vCPU + migration coordinator barrier (size ncores + 1).
    pub mig_barrier: Barrier,

    event: AtomicU8,
    /// States deposited by quiesced vCPUs for the migration coordinator.
    vcpu_states: Mutex<Vec<Option<VcpuState>>>,
    /// States a restarted or migrated-in vCPU must restore from.
    restore_states: Mutex<Vec<Option<VcpuState>>>,
    checkpoint: Mutex<CheckpointRound>,
    /// Guest-advertised allocated regions (FREELIST hypercall).
    mem_mappings: Mutex<Vec<MemRegion>>,
    /// pthread handles of the live vCPU threads, for kicking.
    kick_targets: Mutex<Vec<libc::pthread_t>>,
    /// Serializes process-level teardown.
    teardown: Mutex<()>,
}

impl VmShared {
    pub fn event(&self) -> VmEvent {
        VmEvent::from_u8(self.event.load(Ordering::Acquire))
    }

    fn set_event(&self, event: VmEvent) {
        self.event.store(event as u8, Ordering::Release);
    }

    fn clear_event(&self) {
        self.event.store(VmEvent::None as u8, Ordering::Release);
    }

    /// Register the calling thread as a kick target.
    fn register_kick_target(&self) {
        self.kick_targets
            .lock()
            .unwrap()
            .push(unsafe { libc::pthread_self() });
    }

    /// Interrupt every vCPU thread so it services the pending event.
    fn kick_all_vcpus(&self) {
        for &target in self.kick_targets.lock().unwrap().iter() {
            unsafe {
                libc::pthread_kill(target, kick_signal());
            }
        }
    }

    /// Current checkpoint directory and the number of the round being
    /// written.
    pub fn checkpoint_round(&self) -> (PathBuf, u32) {
        let round = self.checkpoint.lock().unwrap();
        (round.dir.clone(), round.next)
    }

    pub fn take_restore_state(&self, id: u32) -> Option<VcpuState> {
        self.restore_states.lock().unwrap()[id as usize].take()
    }

    pub fn deposit_state(&self, id: u32, state: VcpuState) {
        self.vcpu_states.lock().unwrap()[id as usize] = Some(state);
    }

    pub fn set_mem_mappings(&self, regions: Vec<MemRegion>) {
        *self.mem_mappings.lock().unwrap() = regions;
    }

    /// Start the network poll thread once; subsequent calls are no-ops.
    pub fn start_net_poll(self: &Arc<Self>) {
        let Some(net) = self.net.as_ref() else {
            return;
        };
        if net.poll_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = Arc::clone(self);
        thread::Builder::new()
            .name("kestrel-netpoll".into())
            .spawn(move || {
                let net = shared.net.as_ref().expect("poll thread requires a tap");
                info!("network poll thread started for {}", net.tap.ifname());
                loop {
                    if !crate::net::wait_readable(net.tap.raw_fd()) {
                        break;
                    }
                    // Raise the network IRQ and wait until the guest has
                    // drained the device before polling again.
                    if net.irq.write(1).is_err() {
                        break;
                    }
                    net.drained.wait();
                }
                warn!("network poll thread stopped");
            })
            .expect("failed to spawn the network poll thread");
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Vm
// ═══════════════════════════════════════════════════════════════════════

/// How this process came to own a guest.
enum Startup {
    Fresh,
    CheckpointRestart(Manifest),
    MigrationResponder,
}

/// A virtual machine bound to this process.
pub struct Vm {
    shared: Arc<VmShared>,
    migration_params: MigrationParams,
}

impl Vm {
    /// Construct the VM: probe KVM, allocate guest RAM, and populate it
    /// via whichever startup path applies. `forwarded_args` become the
    /// guest's argv (image path first).
    pub fn new(
        image_path: &str,
        forwarded_args: Vec<String>,
        mut config: VmConfig,
    ) -> Result<Self, VmError> {
        // The kick handler must be in place before any vCPU thread can be
        // signalled.
        register_signal_handler(kick_signal(), kick_handler)
            .map_err(|e| VmError::Io(io::Error::from_raw_os_error(e.errno())))?;

        let kvm = Kvm::new().map_err(|e| VmError::Kvm {
            what: "open /dev/kvm",
            source: e,
        })?;
        let version = kvm.get_api_version();
        if version != KVM_API_VERSION {
            return Err(VmError::ApiVersion(version));
        }

        // Decide the startup path before allocating memory: restarts and
        // incoming migrations dictate the geometry.
        let mut incoming: Option<MigrationStream> = None;
        let mut wire_params = MigrationParams::default();
        let mut incoming_entry = 0u64;
        let startup = if config.migration_server {
            let mut stream = MigrationStream::accept(MIGRATION_PORT)?;
            wire_params = MigrationParams::from(stream.recv_obj::<MigrationParamsWire>()?);
            let metadata: MigrationMetadata = stream.recv_obj()?;
            info!(
                "incoming migration: {} cores, {:#x} bytes, entry {:#x}",
                metadata.ncores, metadata.guest_size, metadata.elf_entry,
            );
            config.ncores = metadata.ncores;
            config.guest_size = metadata.guest_size;
            config.full_checkpoint = metadata.full_checkpoint != 0;
            incoming_entry = metadata.elf_entry;
            incoming = Some(stream);
            Startup::MigrationResponder
        } else if Manifest::path(Path::new(CHECKPOINT_DIR)).exists() {
            let manifest = Manifest::load(Path::new(CHECKPOINT_DIR))?;
            info!(
                "restarting from checkpoint {} ({} cores, {:#x} bytes)",
                manifest.checkpoint_number, manifest.ncores, manifest.guest_size,
            );
            config.ncores = manifest.ncores;
            config.guest_size = manifest.guest_size;
            config.full_checkpoint = manifest.full;
            Startup::CheckpointRestart(manifest)
        } else {
            Startup::Fresh
        };

        let vm = kvm.create_vm().map_err(|e| VmError::Kvm {
            what: "KVM_CREATE_VM",
            source: e,
        })?;

        // Capability probes.
        let tsc_deadline = kvm.check_extension(Cap::TscDeadlineTimer);
        let stable_clock =
            kvm.check_extension_int(Cap::AdjustClock) == KVM_CLOCK_TSC_STABLE as i32;
        if !kvm.check_extension(Cap::Irqfd) {
            return Err(VmError::MissingCapability("KVM_CAP_IRQFD"));
        }

        let ram = init_kvm_arch(&kvm, &vm, &config)?;

        // Populate memory and collect any pending vCPU states.
        let mut restore_states: Vec<Option<VcpuState>> =
            (0..config.ncores).map(|_| None).collect();
        let (entry, boot_base, checkpoint_next) = match &startup {
            Startup::Fresh => {
                let image = loader::load_image(&ram, image_path, &config)?;
                (image.entry, image.boot_base, 0)
            }
            Startup::CheckpointRestart(manifest) => {
                let dir = Path::new(CHECKPOINT_DIR);
                let clock = checkpoint::replay_all(dir, manifest, &ram)?;
                if stable_clock {
                    vm.set_clock(&clock.to_kvm()).map_err(|e| VmError::Kvm {
                        what: "KVM_SET_CLOCK",
                        source: e,
                    })?;
                }
                let last = manifest.checkpoint_number.saturating_sub(1);
                for (id, slot) in restore_states.iter_mut().enumerate() {
                    *slot = Some(checkpoint::read_core_state(dir, last, id as u32)?);
                }
                // The boot parameters live at the image base, which for
                // these images is the entry point.
                (
                    manifest.entry_point,
                    manifest.entry_point,
                    manifest.checkpoint_number,
                )
            }
            Startup::MigrationResponder => {
                let mut stream = incoming.take().expect("responder owns the stream");
                receive_migration(
                    &mut stream,
                    &vm,
                    &ram,
                    &config,
                    &wire_params,
                    stable_clock,
                    &mut restore_states,
                )?;
                stream.close();
                // The boot parameters sit at the image base, which for
                // these images equals the entry point.
                (incoming_entry, incoming_entry, 0)
            }
        };

        // Network backend, wired to IRQ line 11 through an eventfd.
        let net = match &config.netif {
            Some(ifname) => {
                let tap = TapDevice::open(ifname)?;
                let irq = EventFd::new(libc::EFD_NONBLOCK).map_err(VmError::Io)?;
                vm.register_irqfd(&irq, NET_IRQ).map_err(|e| VmError::Kvm {
                    what: "KVM_IRQFD",
                    source: e,
                })?;
                Some(NetState {
                    tap,
                    irq,
                    drained: Semaphore::new(),
                    poll_started: AtomicBool::new(false),
                })
            }
            None => None,
        };

        let migration_params = config
            .migration_params
            .as_deref()
            .map(MigrationParams::from_file)
            .unwrap_or(wire_params);

        let ncores = config.ncores as usize;
        let mut args = vec![image_path.to_string()];
        args.extend(forwarded_args);

        let shared = Arc::new(VmShared {
            tsc_deadline,
            stable_clock,
            entry,
            boot_base,
            forward: collect_forwarded_cmdline(args),
            net,
            chk_barrier: Barrier::new(ncores + 1),
            vcpu_quiesce: Barrier::new(ncores),
            mig_barrier: Barrier::new(ncores + 1),
            event: AtomicU8::new(VmEvent::None as u8),
            vcpu_states: Mutex::new((0..ncores).map(|_| None).collect()),
            restore_states: Mutex::new(restore_states),
            checkpoint: Mutex::new(CheckpointRound {
                dir: PathBuf::from(CHECKPOINT_DIR),
                next: checkpoint_next,
            }),
            mem_mappings: Mutex::new(Vec::new()),
            kick_targets: Mutex::new(Vec::new()),
            teardown: Mutex::new(()),
            kvm,
            vm,
            ram,
            config,
        });

        Ok(Self {
            shared,
            migration_params,
        })
    }

    /// Spawn one thread per vCPU, arm the checkpoint timer and migration
    /// trigger, and run until the guest is done. Returns the process exit
    /// code.
    pub fn run(&mut self) -> Result<i32, VmError> {
        let shared = &self.shared;
        let ncores = shared.config.ncores;

        // SIGUSR1 must be blocked everywhere before any thread exists;
        // the migration thread collects it with sigwait.
        if shared.config.migration_target.is_some() {
            block_migration_trigger();
        }

        let start_barrier = Arc::new(Barrier::new(ncores as usize + 1));
        let mut handles: Vec<JoinHandle<i32>> = Vec::with_capacity(ncores as usize);

        for id in 0..ncores {
            let shared = Arc::clone(shared);
            let start = Arc::clone(&start_barrier);
            let handle = thread::Builder::new()
                .name(format!("kestrel-vcpu{id}"))
                .spawn(move || {
                    let run = || -> Result<i32, VmError> {
                        let mut vcpu = Vcpu::new(Arc::clone(&shared), id)?;
                        shared.register_kick_target();
                        start.wait();
                        if !vcpu.init()? {
                            return Ok(0);
                        }
                        vcpu.run()
                    };
                    match run() {
                        Ok(code) => code,
                        Err(e) => {
                            eprintln!("[ERROR] vCPU {id}: {e}");
                            std::process::exit(1);
                        }
                    }
                })
                .expect("failed to spawn a vCPU thread");
            handles.push(handle);
        }

        // All vCPU descriptors exist past this point.
        start_barrier.wait();

        if shared.config.checkpoint_interval > 0 {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name("kestrel-chktimer".into())
                .spawn(move || checkpoint_timer(shared))
                .expect("failed to spawn the checkpoint timer");
        }

        if let Some(target) = shared.config.migration_target.clone() {
            let shared = Arc::clone(shared);
            let params = self.migration_params;
            thread::Builder::new()
                .name("kestrel-migration".into())
                .spawn(move || migration_trigger_thread(shared, target, params))
                .expect("failed to spawn the migration thread");
        }

        // The boot core decides the fate of the process.
        let mut handles = handles.into_iter();
        let boot_handle = handles.next().expect("at least one vCPU");
        let code = boot_handle.join().expect("boot vCPU thread panicked");

        // Tear down the remaining cores.
        let _guard = shared.teardown.lock().unwrap();
        shared.set_event(VmEvent::Shutdown);
        shared.kick_all_vcpus();
        for handle in handles {
            let _ = handle.join();
        }

        info!("guest finished with code {code}");
        Ok(code)
    }

    /// Shared state, for integration harnesses.
    pub fn shared(&self) -> &Arc<VmShared> {
        &self.shared
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Architecture initialization
// ═══════════════════════════════════════════════════════════════════════

/// x86-64 VM bring-up: identity map and TSS addresses, guest RAM slots,
/// the in-kernel irqchip with kestrel's IOAPIC layout, and the x2APIC
/// API.
fn init_kvm_arch(kvm: &Kvm, vm: &VmFd, config: &VmConfig) -> Result<GuestRam, VmError> {
    // Leave room for a 16 MiB firmware hole when the host can sync the
    // MMU; the fallback matches the legacy layout.
    let identity_base: u64 = if kvm.check_extension(Cap::SyncMmu) {
        let base = 0xFEFF_C000;
        vm.set_identity_map_address(base).map_err(|e| VmError::Kvm {
            what: "KVM_SET_IDENTITY_MAP_ADDR",
            source: e,
        })?;
        base
    } else {
        0xFFFB_C000
    };
    vm.set_tss_address(identity_base as usize + 0x1000)
        .map_err(|e| VmError::Kvm {
            what: "KVM_SET_TSS_ADDR",
            source: e,
        })?;

    let ram = GuestRam::new(config.guest_size, config.mergeable, config.hugepage)?;

    let flags = if USE_DIRTY_LOG {
        KVM_MEM_LOG_DIRTY_PAGES
    } else {
        0
    };
    for (slot, chunk) in ram.chunks().iter().enumerate() {
        let region = kvm_userspace_memory_region {
            slot: slot as u32,
            guest_phys_addr: chunk.guest_addr,
            memory_size: chunk.size,
            userspace_addr: chunk.host_addr,
            flags,
        };
        unsafe {
            vm.set_user_memory_region(region).map_err(|e| VmError::Kvm {
                what: "KVM_SET_USER_MEMORY_REGION",
                source: e,
            })?;
        }
    }

    vm.create_irq_chip().map_err(|e| VmError::Kvm {
        what: "KVM_CREATE_IRQCHIP",
        source: e,
    })?;

    // 32-bit x2APIC IDs without the broadcast quirk; best effort on old
    // kernels.
    let cap = kvm_enable_cap {
        cap: KVM_CAP_X2APIC_API,
        args: [
            u64::from(KVM_X2APIC_API_USE_32BIT_IDS | KVM_X2APIC_API_DISABLE_BROADCAST_QUIRK),
            0,
            0,
            0,
        ],
        ..Default::default()
    };
    if vm.enable_cap(&cap).is_err() {
        warn!("host KVM lacks the x2APIC API extension");
    }

    // Program the IOAPIC redirection table: vectors 0x20 and up, edge
    // triggered, physical destination 0, with only pin 2 masked.
    let mut chip = kvm_irqchip {
        chip_id: KVM_IRQCHIP_IOAPIC,
        ..Default::default()
    };
    vm.get_irqchip(&mut chip).map_err(|e| VmError::Kvm {
        what: "KVM_GET_IRQCHIP",
        source: e,
    })?;
    unsafe {
        let ioapic = &mut chip.chip.ioapic;
        for (pin, redir) in ioapic.redirtbl.iter_mut().enumerate() {
            // Bits: [7:0] vector, [16] mask; everything else fixed-zero
            // (fixed delivery, physical destination, edge trigger).
            redir.bits = (0x20 + pin as u64) | (u64::from(pin == 2) << 16);
        }
    }
    vm.set_irqchip(&chip).map_err(|e| VmError::Kvm {
        what: "KVM_SET_IRQCHIP",
        source: e,
    })?;

    Ok(ram)
}

// ═══════════════════════════════════════════════════════════════════════
//  Checkpoint coordination
// ═══════════════════════════════════════════════════════════════════════

/// Periodic checkpoint driver: one round every `checkpoint_interval`
/// seconds until the process ends.
fn checkpoint_timer(shared: Arc<VmShared>) {
    let interval = Duration::from_secs(u64::from(shared.config.checkpoint_interval));
    loop {
        thread::sleep(interval);
        if let Err(e) = run_checkpoint_round(&shared) {
            eprintln!("[ERROR] checkpoint failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Execute one checkpoint round against quiesced vCPUs.
pub fn run_checkpoint_round(shared: &Arc<VmShared>) -> Result<(), VmError> {
    let (dir, round) = shared.checkpoint_round();
    let full = shared.config.full_checkpoint;
    fs::create_dir_all(&dir)?;

    shared.set_event(VmEvent::Checkpoint);
    shared.kick_all_vcpus();

    // Quiesce: every vCPU is in its handler once this returns.
    shared.chk_barrier.wait();
    shared.clear_event();

    let clock: GuestClock = shared
        .vm
        .get_clock()
        .map_err(|e| VmError::Kvm {
            what: "KVM_GET_CLOCK",
            source: e,
        })?
        .into();

    if USE_DIRTY_LOG {
        dump_via_dirty_log(shared, &dir, round, clock)?;
    } else {
        let selector = if full {
            PageSelector::Present
        } else {
            PageSelector::incremental(round)
        };
        checkpoint::dump_memory(
            &dir,
            round,
            &shared.ram,
            shared.entry,
            selector,
            !full,
            clock,
        )?;
    }

    // Release the vCPUs; their state files are complete by contract with
    // the barrier pair.
    shared.chk_barrier.wait();

    Manifest {
        application_path: shared.forward.args[0].to_string_lossy().into_owned(),
        ncores: shared.config.ncores,
        guest_size: shared.ram.guest_size(),
        checkpoint_number: round + 1,
        entry_point: shared.entry,
        full,
    }
    .store(&dir)?;

    shared.checkpoint.lock().unwrap().next = round + 1;
    info!("checkpoint {round} complete");
    Ok(())
}

/// Dirty-log variant of the memory dump.
fn dump_via_dirty_log(
    shared: &Arc<VmShared>,
    dir: &Path,
    round: u32,
    clock: GuestClock,
) -> Result<(), VmError> {
    use std::io::Write;
    use vm_memory::ByteValued;

    let path = checkpoint::mem_file(dir, round);
    let mut f = io::BufWriter::new(fs::File::create(&path)?);
    f.write_all(clock.as_slice())?;

    let mut buf = vec![0u8; crate::memory::PAGE_SIZE as usize];
    paging::scan_dirty_log(&shared.vm, &shared.ram, |entry, addr, len| {
        let page = &mut buf[..len];
        shared
            .ram
            .read_bytes(addr, page)
            .map_err(|e| io::Error::other(e.to_string()))?;
        f.write_all(&entry.to_le_bytes())?;
        f.write_all(page)
    })?;
    f.flush()?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Migration coordination
// ═══════════════════════════════════════════════════════════════════════

/// Block SIGUSR1 in the calling thread (inherited by all spawned
/// threads), reserving it for the migration trigger.
fn block_migration_trigger() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Migration thread: sleep until SIGUSR1 arrives, then hand the guest
/// over and exit the process.
fn migration_trigger_thread(shared: Arc<VmShared>, target: String, params: MigrationParams) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        let mut sig: libc::c_int = 0;
        libc::sigwait(&set, &mut sig);
    }
    info!("migration trigger received, moving guest to {target}");

    match run_migration_initiator(&shared, &target, params) {
        Ok(()) => {
            info!("migration complete");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("[ERROR] migration failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Initiator side of a migration: handshake, memory, stop-and-copy,
/// vCPU states, clock.
pub fn run_migration_initiator(
    shared: &Arc<VmShared>,
    target: &str,
    params: MigrationParams,
) -> Result<(), VmError> {
    let mut stream = MigrationStream::connect(target, MIGRATION_PORT)?;

    stream.send_obj(&MigrationParamsWire::from(params))?;
    let metadata = MigrationMetadata::new(
        shared.config.ncores,
        shared.ram.guest_size(),
        shared.entry,
        shared.config.full_checkpoint,
    );
    stream.send_obj(&metadata)?;

    // Region declaration: live transfers and guests that never sent a
    // free list cover the full chunks; incremental cold transfers cover
    // only the allocated regions.
    let mappings = shared.mem_mappings.lock().unwrap().clone();
    let live = params.type_ == MigrationType::Live;
    let regions = if live || mappings.is_empty() {
        migration::chunk_regions(&shared.ram)
    } else {
        mappings
    };
    migration::send_regions(&mut stream, &regions)?;

    // Pre-copy while the guest runs.
    if live {
        for round in 0..MIG_ITERS {
            let pages = migration::send_page_round(
                &mut stream,
                &shared.ram,
                shared.entry,
                PageSelector::incremental(round),
                true,
            )?;
            info!("pre-copy round {round}: {pages} pages");
        }
    }

    // Stop-and-copy: quiesce every vCPU and collect its state.
    shared.set_event(VmEvent::Migration);
    shared.kick_all_vcpus();
    shared.mig_barrier.wait();

    if live {
        // Final delta. The scan leaves the dirty bits in place.
        let pages = migration::send_page_round(
            &mut stream,
            &shared.ram,
            shared.entry,
            PageSelector::Dirty,
            false,
        )?;
        info!("stop-and-copy: {pages} pages");
    } else {
        migration::send_raw_regions(&mut stream, &shared.ram, &regions)?;
        info!("guest memory sent ({} region(s))", regions.len());
    }

    let states: Vec<VcpuState> = {
        let deposited = shared.vcpu_states.lock().unwrap();
        deposited
            .iter()
            .map(|s| s.expect("every vCPU deposited its state at the barrier"))
            .collect()
    };
    migration::send_cpu_states(&mut stream, &states)?;

    let clock: GuestClock = shared
        .vm
        .get_clock()
        .map_err(|e| VmError::Kvm {
            what: "KVM_GET_CLOCK",
            source: e,
        })?
        .into();
    migration::send_clock(&mut stream, clock)?;

    stream.close();
    Ok(())
}

/// Responder side: receive memory, vCPU states, and the clock into a
/// freshly allocated VM.
fn receive_migration(
    stream: &mut MigrationStream,
    vm: &VmFd,
    ram: &GuestRam,
    config: &VmConfig,
    params: &MigrationParams,
    stable_clock: bool,
    restore_states: &mut [Option<VcpuState>],
) -> Result<(), VmError> {
    let regions = migration::recv_regions(stream)?;

    if params.type_ == MigrationType::Live {
        for round in 0..=MIG_ITERS {
            let pages = migration::recv_page_round(stream, ram)?;
            info!("received pre-copy round {round}: {pages} pages");
        }
    } else {
        migration::recv_raw_regions(stream, ram, &regions)?;
        info!("guest memory received ({} region(s))", regions.len());
    }

    let states = migration::recv_cpu_states(stream, config.ncores)?;
    for (slot, state) in restore_states.iter_mut().zip(states) {
        *slot = Some(state);
    }

    let clock = migration::recv_clock(stream)?;
    if stable_clock {
        vm.set_clock(&clock.to_kvm()).map_err(|e| VmError::Kvm {
            what: "KVM_SET_CLOCK",
            source: e,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_roundtrip() {
        for event in [
            VmEvent::None,
            VmEvent::Checkpoint,
            VmEvent::Migration,
            VmEvent::Shutdown,
        ] {
            assert_eq!(VmEvent::from_u8(event as u8), event);
        }
    }

    #[test]
    fn unknown_event_is_none() {
        assert_eq!(VmEvent::from_u8(0xFF), VmEvent::None);
    }
}
