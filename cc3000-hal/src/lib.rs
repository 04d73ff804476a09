//! # `cc3000-hal`
//! This is an async driver for the TI CC3000 WiFi network processor.
//! It runs on top of the [embedded-hal](embedded_hal) traits and doesn't depend on any particular
//! executor.
//! ## Hardware overview
//! This chapter will give a short overview of how the host talks to the CC3000.
//!
//! ### SPI
//! The CC3000 is connected through SPI, a chip select line, an enable line (WEN) and an interrupt
//! line (IRQ). The chip runs the entire network stack itself, so the host only issues BSD style
//! socket calls. The SPI link is half duplex: the chip pulls IRQ low, when it has something for
//! the host and the host then clocks it out. When the host wants to write, it asserts chip select
//! and waits for the chip to acknowledge that by pulling IRQ low. The very first write after
//! powering up is special, since the chip doesn't acknowledge it. Instead the host has to pause
//! after the first four bytes.
//!
//! ### HCI
//! On top of SPI, the chip speaks a protocol called HCI. There are commands, which the host sends
//! and to which the chip answers with an event carrying the same opcode, unsolicited events,
//! which report things like the link coming up or a DHCP lease being acquired, and data frames,
//! which carry socket payloads in both directions. Only one command may be in flight at any time.
//! Data frames written to the chip occupy one of its buffers, until the chip returns it through
//! an unsolicited event.
//!
//! ### Driver structure
//! All frames from the chip are read by the [Runner], which routes them to the waiting caller.
//! The [Cc3000] handles serialize commands among themselves and hand them to the [Runner] for
//! transmission. Both share a [State], which is allocated by the user and passed to [init].
//! Any corruption of the SPI link is fatal and requires the driver to be reinitialized through
//! [Cc3000::reinit].

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod board;
mod config;
mod control;
mod driver;
mod error;
mod hci;
#[cfg(test)]
mod mock;
mod runner;
mod socket;
mod sync;
mod transport;

pub use board::BoardProfile;
pub use config::Config;
pub use control::{
    AccessPoint, IpSettings, LinkInfo, LinkState, ScanResults, Security, MAX_HOSTNAME_LENGTH,
    MAX_KEY_LENGTH, MAX_SCAN_RESULTS, MAX_SSID_LENGTH,
};
pub use driver::{
    init, Cc3000, State, SOCKOPT_ACCEPT_NONBLOCK, SOCKOPT_RECV_NONBLOCK, SOCKOPT_RECV_TIMEOUT,
    SOL_SOCKET,
};
pub use error::{Error, Result};
pub use runner::Runner;
pub use socket::{Family, SocketHandle, SocketState, SocketType, MAX_SOCKETS};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
