//! Boot a unikernel image under kestrel.
//!
//! Usage: kestrel <image> [guest arguments...]
//!
//! All configuration comes from `KESTREL_*` environment variables; the
//! positional arguments are forwarded to the guest as its command line.

use std::env;
use std::process::ExitCode;

use kestrel_vmm::{Vm, VmConfig};

#[cfg(not(target_arch = "x86_64"))]
compile_error!("kestrel currently targets x86_64 hosts only");

fn main() -> ExitCode {
    let default_filter = if env::var("KESTREL_VERBOSE").map(|v| v != "0").unwrap_or(false) {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut args = env::args().skip(1);
    let Some(image) = args.next() else {
        eprintln!("Usage: kestrel <image> [guest arguments...]");
        return ExitCode::FAILURE;
    };
    let guest_args: Vec<String> = args.collect();

    let config = VmConfig::from_env();
    log::info!(
        "kestrel: {} MiB guest RAM, {} core(s)",
        config.guest_size >> 20,
        config.ncores,
    );

    let mut vm = match Vm::new(&image, guest_args, config) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            return ExitCode::FAILURE;
        }
    };

    match vm.run() {
        Ok(code) => ExitCode::from((code & 0xFF) as u8),
        Err(e) => {
            eprintln!("[ERROR] {e}");
            ExitCode::FAILURE
        }
    }
}
