//! Demo instrumented data set published by the daemon.
//!
//! The block is leaked on startup and only ever touched through the agent's
//! guarded raw-pointer accesses afterwards, the same discipline a firmware
//! integration follows for its instrumented statics.

use core::mem::{offset_of, size_of};

#[repr(C)]
pub struct DemoTarget {
    pub boot_count: u32,
    pub uptime_ticks: u32,
    pub sensor_mv: [u16; 8],
    pub message: [u8; 32],
    pub secret_key: [u8; 16],
}

/// Addresses of the installed demo block, for the startup banner and the
/// guard configuration.
pub struct DemoLayout {
    pub base: usize,
    pub len: usize,
    pub message_addr: usize,
    pub secret_start: usize,
    pub secret_end: usize,
}

impl DemoTarget {
    fn seed() -> Self {
        let mut message = [0u8; 32];
        let text = b"probelink demo target";
        message[..text.len()].copy_from_slice(text);
        Self {
            boot_count: 1,
            uptime_ticks: 0,
            sensor_mv: [3300, 3287, 3301, 3295, 1650, 1648, 0, 0],
            message,
            secret_key: *b"do-not-read-this",
        }
    }

    /// Leaks a seeded block and returns its address map.
    pub fn install() -> DemoLayout {
        let target = Box::into_raw(Box::new(Self::seed()));
        let base = target as usize;
        let secret_start = base + offset_of!(DemoTarget, secret_key);
        DemoLayout {
            base,
            len: size_of::<DemoTarget>(),
            message_addr: base + offset_of!(DemoTarget, message),
            secret_start,
            secret_end: secret_start + size_of::<[u8; 16]>(),
        }
    }
}
