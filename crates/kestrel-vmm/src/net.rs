//! Tap-backed guest networking.
//!
//! kestrel does not emulate a NIC. The guest moves whole frames through
//! the NETWRITE/NETREAD hypercalls, and the host shuttles them to a tap
//! interface named by `KESTREL_NETIF`. Inbound readiness is signalled by a
//! dedicated poll thread that raises the network IRQ line through an
//! eventfd and then parks on a semaphore until the guest has drained the
//! device (a NETREAD that comes up empty releases it).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Condvar, Mutex};

use log::{info, warn};
use thiserror::Error;

/// Errors from tap device setup.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to open /dev/net/tun: {0}")]
    OpenTun(#[source] io::Error),

    #[error("failed to attach tap interface '{ifname}': {source}")]
    Attach {
        ifname: String,
        #[source]
        source: io::Error,
    },

    #[error("tap interface name '{0}' is too long")]
    NameTooLong(String),
}

// ═══════════════════════════════════════════════════════════════════════
//  Semaphore
// ═══════════════════════════════════════════════════════════════════════

/// Minimal counting semaphore for the poll-thread handshake.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Release one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until a post arrives.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tap device
// ═══════════════════════════════════════════════════════════════════════

/// An attached tap interface.
#[derive(Debug)]
pub struct TapDevice {
    file: File,
    ifname: String,
    mac_str: [u8; 18],
}

impl TapDevice {
    /// Attach to the host tap interface `ifname` through `/dev/net/tun`.
    ///
    /// The device is switched to non-blocking mode; NETREAD surfaces an
    /// empty queue to the guest instead of stalling the vCPU.
    pub fn open(ifname: &str) -> Result<Self, NetError> {
        if ifname.len() >= libc::IFNAMSIZ {
            return Err(NetError::NameTooLong(ifname.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(NetError::OpenTun)?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &ifr) };
        if ret < 0 {
            return Err(NetError::Attach {
                ifname: ifname.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
        if ret < 0 {
            warn!("could not switch {ifname} to non-blocking mode");
        }

        info!("guest network bound to tap interface {ifname}");

        Ok(Self {
            file,
            ifname: ifname.to_string(),
            mac_str: derive_mac(ifname),
        })
    }

    /// The NUL-terminated MAC string handed to the guest over NETINFO.
    pub fn mac_str(&self) -> &[u8; 18] {
        &self.mac_str
    }

    /// Interface name.
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Raw descriptor for poll and frame I/O.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Derive a stable locally-administered MAC from the interface name.
///
/// Stable across restarts so that a restored or migrated guest keeps the
/// address it has already configured.
fn derive_mac(ifname: &str) -> [u8; 18] {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in ifname.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    let h = hash.to_le_bytes();

    let mut mac = [0u8; 18];
    let text = format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        h[0], h[1], h[2], h[3], h[4]
    );
    mac[..17].copy_from_slice(text.as_bytes());
    mac
}

/// Block until the tap device has a readable frame.
///
/// Returns `false` on poll failure other than interruption.
pub fn wait_readable(fd: RawFd) -> bool {
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("tap poll failed: {err}");
            return false;
        }
        if ret > 0 && pfd.revents & libc::POLLIN != 0 {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn mac_is_text_local_and_stable() {
        let a = derive_mac("tap0");
        let b = derive_mac("tap0");
        let c = derive_mac("tap1");
        assert_eq!(a, b, "same interface, same MAC");
        assert_ne!(a, c, "different interfaces diverge");

        assert_eq!(a[17], 0, "NUL terminated");
        let text = std::str::from_utf8(&a[..17]).unwrap();
        assert!(text.starts_with("02:"), "locally administered");
        assert_eq!(text.split(':').count(), 6);
    }

    #[test]
    fn semaphore_hands_off() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(10));
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn semaphore_counts_posts() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        // Two buffered posts satisfy two waits without blocking.
        sem.wait();
        sem.wait();
    }

    #[test]
    fn overlong_ifname_is_rejected() {
        let err = TapDevice::open("this-interface-name-is-way-too-long").unwrap_err();
        assert!(matches!(err, NetError::NameTooLong(_)));
    }
}
