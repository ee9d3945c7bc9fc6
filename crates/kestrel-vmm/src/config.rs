//! Environment-driven configuration for a kestrel VM.
//!
//! Every knob is an environment variable with the `KESTREL_` prefix, read
//! once at startup into a [`VmConfig`] value. The variables and their
//! semantics:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `KESTREL_MEM` | guest memory size, suffix `K/M/G/T/P/E` | 512 MiB |
//! | `KESTREL_CPUS` | number of vCPUs | 1 |
//! | `KESTREL_VERBOSE` | nonzero enables UART passthrough and progress logs | off |
//! | `KESTREL_NETIF` | host tap interface name, presence activates networking | none |
//! | `KESTREL_IP` | guest IPv4 address for the boot parameters | none |
//! | `KESTREL_GATEWAY` | guest IPv4 gateway | none |
//! | `KESTREL_MASK` | guest IPv4 netmask | none |
//! | `KESTREL_MERGEABLE` | nonzero advises KSM merging of guest RAM | off |
//! | `KESTREL_HUGEPAGE` | zero disables transparent huge pages | on |
//! | `KESTREL_CHECKPOINT` | periodic checkpoint interval in seconds, 0 disables | 0 |
//! | `KESTREL_FULLCHECKPOINT` | nonzero forces full dumps | off |
//! | `KESTREL_MIGRATION_SERVER` | boot as migration responder | off |
//! | `KESTREL_MIGRATION_SUPPORT` | destination IPv4 for outbound migration | none |
//! | `KESTREL_MIGRATION_PARAMS` | path to a migration parameter file | none |
//! | `KESTREL_PORT` | override for the proxy control port | 0x494E |

use std::env;
use std::net::Ipv4Addr;

/// Default guest memory size: 512 MiB.
pub const DEFAULT_GUEST_SIZE: u64 = 0x2000_0000;

/// Default proxy control port.
pub const DEFAULT_CONTROL_PORT: u16 = 0x494E;

/// Complete configuration of a kestrel VM, resolved from the environment.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Guest physical memory size in bytes (before gap inflation).
    pub guest_size: u64,
    /// Number of vCPUs.
    pub ncores: u32,
    /// UART passthrough and progress logging.
    pub verbose: bool,
    /// Host tap interface to bind the guest NIC to.
    pub netif: Option<String>,
    /// Guest IPv4 address injected into the boot parameters.
    pub ip: Option<Ipv4Addr>,
    /// Guest IPv4 gateway.
    pub gateway: Option<Ipv4Addr>,
    /// Guest IPv4 netmask.
    pub mask: Option<Ipv4Addr>,
    /// Advise the kernel that guest RAM is KSM-mergeable.
    pub mergeable: bool,
    /// Back guest RAM with transparent huge pages.
    pub hugepage: bool,
    /// Periodic checkpoint interval in seconds, 0 disables the timer.
    pub checkpoint_interval: u32,
    /// Force full dumps instead of incremental ones.
    pub full_checkpoint: bool,
    /// Boot as the migration responder and wait on the migration port.
    pub migration_server: bool,
    /// Destination IPv4 address for outbound migration.
    pub migration_target: Option<String>,
    /// Path to the plain-text migration parameter file.
    pub migration_params: Option<String>,
    /// Proxy control port.
    pub control_port: u16,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            guest_size: DEFAULT_GUEST_SIZE,
            ncores: 1,
            verbose: false,
            netif: None,
            ip: None,
            gateway: None,
            mask: None,
            mergeable: false,
            hugepage: true,
            checkpoint_interval: 0,
            full_checkpoint: false,
            migration_server: false,
            migration_target: None,
            migration_params: None,
            control_port: DEFAULT_CONTROL_PORT,
        }
    }
}

impl VmConfig {
    /// Build a configuration from the `KESTREL_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed values fall back to
    /// the default for that variable rather than failing startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(mem) = env::var("KESTREL_MEM") {
            cfg.guest_size = memparse(&mem);
        }
        if let Ok(cpus) = env::var("KESTREL_CPUS") {
            cfg.ncores = cpus.trim().parse().unwrap_or(1).max(1);
        }
        cfg.verbose = flag_set("KESTREL_VERBOSE");
        cfg.netif = env::var("KESTREL_NETIF").ok().filter(|s| !s.is_empty());
        cfg.ip = parse_quad("KESTREL_IP");
        cfg.gateway = parse_quad("KESTREL_GATEWAY");
        cfg.mask = parse_quad("KESTREL_MASK");
        cfg.mergeable = flag_set("KESTREL_MERGEABLE");
        // Huge pages are on unless explicitly disabled with "0".
        cfg.hugepage = env::var("KESTREL_HUGEPAGE").map(|v| v != "0").unwrap_or(true);
        if let Ok(secs) = env::var("KESTREL_CHECKPOINT") {
            cfg.checkpoint_interval = secs.trim().parse().unwrap_or(0);
        }
        cfg.full_checkpoint = flag_set("KESTREL_FULLCHECKPOINT");
        cfg.migration_server = env::var("KESTREL_MIGRATION_SERVER").is_ok();
        cfg.migration_target = env::var("KESTREL_MIGRATION_SUPPORT").ok();
        cfg.migration_params = env::var("KESTREL_MIGRATION_PARAMS").ok();
        if let Ok(port) = env::var("KESTREL_PORT") {
            cfg.control_port = port.trim().parse().unwrap_or(DEFAULT_CONTROL_PORT);
        }

        cfg
    }
}

/// True when the variable is set to anything other than "0".
fn flag_set(name: &str) -> bool {
    env::var(name).map(|v| v != "0").unwrap_or(false)
}

/// Parse a dotted IPv4 quad from the environment.
fn parse_quad(name: &str) -> Option<Ipv4Addr> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a memory size with the classic `K/M/G/T/P/E` suffixes.
///
/// Each suffix letter shifts the value by another factor of 1024, and the
/// suffixes accumulate downward: `1G` is `1 << 30`, `2M` is `2 << 20`.
/// Numbers accept the usual `0x` prefix. A missing or unknown suffix leaves
/// the parsed number unscaled.
pub fn memparse(input: &str) -> u64 {
    let s = input.trim();
    let (num, rest) = split_number(s);

    let mut size = num;
    // Intentional fall-through: every suffix below the given one applies
    // another 1024 factor, exactly like the kernel's memparse.
    let shifts: u32 = match rest.chars().next() {
        Some('E') | Some('e') => 6,
        Some('P') | Some('p') => 5,
        Some('T') | Some('t') => 4,
        Some('G') | Some('g') => 3,
        Some('M') | Some('m') => 2,
        Some('K') | Some('k') => 1,
        _ => 0,
    };
    size <<= 10 * shifts;
    size
}

/// Split a decimal or `0x` hexadecimal prefix off a string.
fn split_number(s: &str) -> (u64, &str) {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let end = hex.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(hex.len());
        let num = u64::from_str_radix(&hex[..end], 16).unwrap_or(0);
        (num, &hex[end..])
    } else {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let num = s[..end].parse().unwrap_or(0);
        (num, &s[end..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memparse_plain_number() {
        assert_eq!(memparse("4096"), 4096);
    }

    #[test]
    fn memparse_suffixes() {
        assert_eq!(memparse("1K"), 1 << 10);
        assert_eq!(memparse("1M"), 1 << 20);
        assert_eq!(memparse("1G"), 1 << 30);
        assert_eq!(memparse("1T"), 1u64 << 40);
        assert_eq!(memparse("2g"), 2u64 << 30);
    }

    #[test]
    fn memparse_hex() {
        assert_eq!(memparse("0x200"), 0x200);
        assert_eq!(memparse("0x20M"), 0x20 << 20);
    }

    #[test]
    fn memparse_default_guest_size_is_512_mib() {
        assert_eq!(memparse("512M"), DEFAULT_GUEST_SIZE);
    }

    #[test]
    fn memparse_garbage_is_zero() {
        assert_eq!(memparse("banana"), 0);
    }

    #[test]
    fn default_config() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.guest_size, DEFAULT_GUEST_SIZE);
        assert_eq!(cfg.ncores, 1);
        assert!(!cfg.verbose);
        assert!(cfg.hugepage, "huge pages default on");
        assert!(!cfg.mergeable, "mergeable defaults off");
        assert_eq!(cfg.checkpoint_interval, 0);
        assert_eq!(cfg.control_port, DEFAULT_CONTROL_PORT);
    }
}
