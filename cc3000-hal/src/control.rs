//! Association, addressing and scanning.
//!
//! Associating with an access point happens in two steps, both of which the chip reports through
//! unsolicited events. First the link comes up, then DHCP (or the static configuration) assigns
//! an address. The [LinkMonitor] tracks this, while the runner feeds it events.

use core::{future::Future, net::Ipv4Addr};

#[cfg(feature = "full")]
use bitfield_struct::bitfield;
use embassy_time::with_timeout;
#[cfg(feature = "full")]
use embassy_time::{Duration, Timer};
use heapless::{String, Vec};
use macro_bits::serializable_enum;
use portable_atomic::{AtomicU8, Ordering};

use crate::{
    driver::{check, CommandChannel},
    hci::{FrameBuilder, Opcode, Reply},
    sync::Notifier,
    Cc3000, Error, Result,
};

/// The longest SSID the chip accepts.
pub const MAX_SSID_LENGTH: usize = 32;
/// The longest key the chip accepts.
pub const MAX_KEY_LENGTH: usize = 32;
/// The longest host name [Cc3000::gethostbyname] accepts.
pub const MAX_HOSTNAME_LENGTH: usize = 128;
/// The most access points [Cc3000::scan] reports.
pub const MAX_SCAN_RESULTS: usize = 16;

/// Our view of the association with an access point.
///
/// The state only ever advances one step at a time, but can drop back to [LinkState::Down] from
/// anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LinkState {
    Down = 0,
    /// The connect command was issued.
    Connecting = 1,
    /// Associated, but without an address.
    Connected = 2,
    /// Associated and addressed. This is the only state in which sockets are useful.
    ConnectedDhcp = 3,
}
impl LinkState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::ConnectedDhcp,
            _ => Self::Down,
        }
    }
}

pub(crate) struct LinkMonitor {
    state: AtomicU8,
    notifier: Notifier,
}
impl LinkMonitor {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Down as u8),
            notifier: Notifier::new(),
        }
    }
    pub fn get(&self) -> LinkState {
        LinkState::from_raw(self.state.load(Ordering::Acquire))
    }
    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        let done = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if done {
            debug!("Link state: {:?} -> {:?}", from, to);
            self.notifier.notify();
        }
        done
    }
    /// A connect command is about to be issued.
    pub fn begin_connect(&self) -> bool {
        self.transition(LinkState::Down, LinkState::Connecting)
    }
    /// The chip reported the link to be up.
    pub fn link_up(&self) {
        if !self.transition(LinkState::Connecting, LinkState::Connected) {
            warn!("Ignoring link up event in state {:?}.", self.get());
        }
    }
    /// The chip reported a completed DHCP exchange.
    pub fn dhcp_complete(&self, ip: Ipv4Addr) {
        if self.transition(LinkState::Connected, LinkState::ConnectedDhcp) {
            info!("Link is up with address {:?}.", ip.octets());
        } else if self.get() == LinkState::ConnectedDhcp {
            debug!("DHCP lease renewed with address {:?}.", ip.octets());
        } else {
            warn!("Ignoring DHCP event in state {:?}.", self.get());
        }
    }
    /// Drop the link. Returns the previous state.
    pub fn go_down(&self) -> LinkState {
        let previous =
            LinkState::from_raw(self.state.swap(LinkState::Down as u8, Ordering::AcqRel));
        if previous != LinkState::Down {
            debug!("Link state: {:?} -> Down", previous);
            self.notifier.notify();
        }
        previous
    }
    /// Wait until `check` yields a value. It's evaluated on every change of the state.
    pub fn wait_for<'a, T>(
        &'a self,
        mut check: impl FnMut(LinkState) -> Option<T> + 'a,
    ) -> impl Future<Output = T> + 'a {
        self.notifier.wait_for(move || check(self.get()))
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// The security mode of a network.
    pub enum Security: u8 {
        #[default]
        Unsecured => 0,
        Wep => 1,
        Wpa => 2,
        Wpa2 => 3
    }
}

/// A static address configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpSettings {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}
impl IpSettings {
    /// Fill in unspecified fields.
    ///
    /// The mask defaults to a host mask, the gateway to the first address of the /24 the address
    /// is in and DNS to 8.8.8.8. Yields [None] for an unspecified address, which means DHCP.
    pub fn with_defaults(
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> Option<Self> {
        if ip.is_unspecified() {
            return None;
        }
        let [a, b, c, _] = ip.octets();
        Some(Self {
            ip,
            mask: if mask.is_unspecified() {
                Ipv4Addr::BROADCAST
            } else {
                mask
            },
            gateway: if gateway.is_unspecified() {
                Ipv4Addr::new(a, b, c, 1)
            } else {
                gateway
            },
            dns: if dns.is_unspecified() {
                Ipv4Addr::new(8, 8, 8, 8)
            } else {
                dns
            },
        })
    }
}

/// The address configuration the chip is currently using.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub mac: [u8; 6],
    /// The SSID of the network we're associated with.
    pub ssid: String<MAX_SSID_LENGTH>,
}
impl LinkInfo {
    fn parse(reply: &Reply) -> Result<Self> {
        if reply.status != 0 {
            return Err(Error::Io(-(reply.status as i32)));
        }
        let mut args = reply.reader();
        Ok(Self {
            ip: args.ip()?,
            mask: args.ip()?,
            gateway: args.ip()?,
            dhcp_server: args.ip()?,
            dns: args.ip()?,
            mac: args.bytes()?,
            ssid: ssid_from_bytes(&args.bytes::<MAX_SSID_LENGTH>()?).unwrap_or_default(),
        })
    }
}

/// The SSID up to the first NUL byte. Yields [None], if it isn't valid UTF-8.
fn ssid_from_bytes(raw: &[u8]) -> Option<String<MAX_SSID_LENGTH>> {
    let length = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    let mut ssid = String::new();
    ssid.push_str(core::str::from_utf8(&raw[..length]).ok()?).ok()?;
    Some(ssid)
}

/// An access point found by [Cc3000::scan].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String<MAX_SSID_LENGTH>,
    pub security: Security,
    /// Signal strength in dBm.
    pub rssi: i8,
    pub bssid: [u8; 6],
}

pub type ScanResults = Vec<AccessPoint, MAX_SCAN_RESULTS>;

#[cfg(feature = "full")]
#[bitfield(u8)]
struct RssiField {
    valid: bool,
    #[bits(7)]
    rssi: u8,
}

#[cfg(feature = "full")]
#[bitfield(u8)]
struct SecurityField {
    #[bits(2)]
    security: u8,
    #[bits(6)]
    ssid_length: u8,
}

/// Parse one entry returned by the chip.
///
/// Yields the number of entries left, including this one, and the access point, if the entry is
/// usable.
#[cfg(feature = "full")]
fn parse_scan_entry(reply: &Reply) -> Result<(u32, Option<AccessPoint>)> {
    let mut args = reply.reader();
    let remaining = args.u32()?;
    let status = args.u32()?;
    let rssi = RssiField::from_bits(args.u8()?);
    let security = SecurityField::from_bits(args.u8()?);
    let _time = args.u16()?;
    let ssid = args.bytes::<MAX_SSID_LENGTH>()?;
    let bssid = args.bytes()?;
    // Status 0 are aged and 1 are fresh results.
    if remaining == 0 || status > 1 || !rssi.valid() {
        return Ok((remaining, None));
    }
    let length = (security.ssid_length() as usize).min(MAX_SSID_LENGTH);
    let Some(ssid) = ssid_from_bytes(&ssid[..length]) else {
        warn!("Skipping network with a non UTF-8 SSID.");
        return Ok((remaining, None));
    };
    Ok((
        remaining,
        Some(AccessPoint {
            ssid,
            security: Security::from_bits(security.security()),
            rssi: (rssi.rssi() as i16 - 128) as i8,
            bssid,
        }),
    ))
}

/// Add an access point, keeping only the strongest entry per SSID.
#[cfg(feature = "full")]
fn record(results: &mut ScanResults, access_point: AccessPoint) {
    if let Some(known) = results
        .iter_mut()
        .find(|known| known.ssid == access_point.ssid)
    {
        if access_point.rssi > known.rssi {
            *known = access_point;
        }
        return;
    }
    if let Err(access_point) = results.push(access_point) {
        if let Some(weakest) = results.iter_mut().min_by_key(|known| known.rssi) {
            if access_point.rssi > weakest.rssi {
                *weakest = access_point;
            }
        }
    }
}

/// Strongest first, ties broken by SSID.
#[cfg(feature = "full")]
fn order(results: &mut ScanResults) {
    results.sort_unstable_by(|a, b| {
        b.rssi
            .cmp(&a.rssi)
            .then_with(|| a.ssid.as_str().cmp(b.ssid.as_str()))
    });
}

/// The scan interval in milliseconds. Zero would stop the scan, so it's at least one.
#[cfg(feature = "full")]
fn scan_interval(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis())
        .unwrap_or(u32::MAX)
        .max(1)
}

#[cfg(feature = "full")]
fn scan_params(interval: u32) -> Result<crate::hci::TxFrame> {
    let builder = FrameBuilder::command(Opcode::WlanSetScanParams)
        .u32(36)
        .u32(interval)
        // Minimum and maximum dwell time per channel.
        .u32(20)
        .u32(100)
        // Probes per channel.
        .u32(5)
        // All channels.
        .u32(0x1fff)
        .i32(-120)
        .u32(0)
        // Default TX power.
        .u32(300);
    (0..16)
        .fold(builder, |builder, _| builder.u32(2000))
        .finish()
}

impl Cc3000<'_> {
    /// The current state of the link.
    pub fn link_state(&self) -> LinkState {
        self.state.link.get()
    }
    async fn disconnect(&self, commands: &mut CommandChannel<'_>) {
        let frame = match FrameBuilder::command(Opcode::WlanDisconnect).finish() {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if let Err(error) = commands
            .execute(frame, Opcode::WlanDisconnect, self.config.command_timeout)
            .await
        {
            debug!("Disconnect failed: {:?}", error);
        }
        if self.state.link.go_down() != LinkState::Down {
            self.state.sockets.close_all();
        }
    }
    /// Associate with a network and wait for an address.
    ///
    /// Failing to associate within [Config::link_timeout](crate::Config::link_timeout) yields
    /// [Error::AuthFailure], not getting an address within
    /// [Config::dhcp_timeout](crate::Config::dhcp_timeout) yields [Error::Timeout]. In both cases
    /// the link is taken down again.
    pub async fn link(&self, ssid: &str, security: Security, key: &str) -> Result<()> {
        let key = match security {
            Security::Unsecured => "",
            _ => key,
        };
        if ssid.is_empty() || ssid.len() > MAX_SSID_LENGTH || key.len() > MAX_KEY_LENGTH {
            return Err(Error::InvalidArgument);
        }
        let mut commands = self.commands().await;
        if self.state.link.get() != LinkState::Down {
            self.disconnect(&mut commands).await;
        }
        let timeout = self.config.command_timeout;

        let addressing = self.state.static_ip.lock(|settings| settings.get());
        let reply = commands
            .execute(dhcp_frame(addressing)?, Opcode::NetappDhcp, timeout)
            .await?;
        check(&reply)?;

        self.state.link.begin_connect();
        info!("Associating with {}.", ssid);
        let frame = FrameBuilder::command(Opcode::WlanConnect)
            .u32(0x1c)
            .u32(ssid.len() as u32)
            .u32(security.into_bits() as u32)
            .u32(0x10 + ssid.len() as u32)
            .u32(key.len() as u32)
            .u16(0)
            .bytes(&[0; 6])
            .bytes(ssid.as_bytes())
            .bytes(key.as_bytes())
            .finish()?;
        if let Err(error) = commands
            .execute(frame, Opcode::WlanConnect, timeout)
            .await
            .and_then(|reply| check(&reply))
        {
            self.state.link.go_down();
            return Err(match error {
                Error::Io(_) => Error::AuthFailure,
                error => error,
            });
        }

        let associated = self.state.link.wait_for(|state| match state {
            LinkState::Connecting => None,
            LinkState::Down => Some(false),
            _ => Some(true),
        });
        if !matches!(with_timeout(self.config.link_timeout, associated).await, Ok(true)) {
            warn!("Failed to associate with {}.", ssid);
            self.disconnect(&mut commands).await;
            return Err(Error::AuthFailure);
        }
        let addressed = self.state.link.wait_for(|state| match state {
            LinkState::ConnectedDhcp => Some(true),
            LinkState::Down => Some(false),
            _ => None,
        });
        if !matches!(with_timeout(self.config.dhcp_timeout, addressed).await, Ok(true)) {
            warn!("Didn't get an address from {}.", ssid);
            self.disconnect(&mut commands).await;
            return Err(Error::Timeout);
        }

        let frame = FrameBuilder::command(Opcode::NetappSetTimers)
            .u32(self.config.dhcp_lease)
            .u32(self.config.arp_timeout)
            .u32(self.config.keepalive)
            .u32(self.config.inactivity)
            .finish()?;
        check(
            &commands
                .execute(frame, Opcode::NetappSetTimers, timeout)
                .await?,
        )?;
        Ok(())
    }
    /// Disassociate from the network. This closes all sockets.
    ///
    /// Calling this while the link is down does nothing.
    pub async fn unlink(&self) -> Result<()> {
        let mut commands = self.commands().await;
        if self.state.link.get() == LinkState::Down {
            return Ok(());
        }
        info!("Unlinking.");
        self.disconnect(&mut commands).await;
        Ok(())
    }
    /// Query the address configuration from the chip.
    pub async fn link_info(&self) -> Result<LinkInfo> {
        let frame = FrameBuilder::command(Opcode::NetappIpConfig).finish()?;
        LinkInfo::parse(&self.command(frame, Opcode::NetappIpConfig).await?)
    }
    /// Configure a static address, used from the next [Cc3000::link] on.
    ///
    /// Unspecified fields are filled in as described in [IpSettings::with_defaults]. Passing an
    /// unspecified address switches back to DHCP.
    pub async fn set_link_info(
        &self,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> Result<Option<IpSettings>> {
        let settings = IpSettings::with_defaults(ip, mask, gateway, dns);
        check(
            &self
                .command(dhcp_frame(settings)?, Opcode::NetappDhcp)
                .await?,
        )?;
        self.state.static_ip.lock(|stored| stored.set(settings));
        Ok(settings)
    }
    /// Scan for networks.
    ///
    /// The chip scans for `duration`, after which the results are collected. Every SSID is only
    /// reported once, with the strongest signal seen. The results are ordered by signal strength.
    #[cfg(feature = "full")]
    pub async fn scan(&self, duration: Duration) -> Result<ScanResults> {
        let timeout = self.config.command_timeout;
        let frame = scan_params(scan_interval(duration))?;
        check(&self.command(frame, Opcode::WlanSetScanParams).await?)?;
        // Other commands may go through while the chip is scanning.
        Timer::after(duration + Duration::from_millis(500)).await;

        let mut commands = self.commands().await;

        let mut results = ScanResults::new();
        let collected = async {
            // Bounded, in case the chip keeps reporting more entries.
            for _ in 0..64 {
                let frame = FrameBuilder::command(Opcode::WlanGetScanResults)
                    .u32(0)
                    .finish()?;
                let reply = commands
                    .execute(frame, Opcode::WlanGetScanResults, timeout)
                    .await?;
                let (remaining, access_point) = parse_scan_entry(&reply)?;
                if let Some(access_point) = access_point {
                    trace!("Found {} at {} dBm.", access_point.ssid.as_str(), access_point.rssi);
                    record(&mut results, access_point);
                }
                if remaining <= 1 {
                    break;
                }
            }
            Ok::<_, Error>(())
        }
        .await;
        // Stop the periodic scan again.
        let stopped = commands
            .execute(scan_params(0)?, Opcode::WlanSetScanParams, timeout)
            .await;
        collected?;
        stopped?;
        order(&mut results);
        Ok(results)
    }
    /// Resolve a host name through the chip.
    #[cfg(feature = "full")]
    pub async fn gethostbyname(&self, name: &str) -> Result<Ipv4Addr> {
        if name.is_empty() || name.len() > MAX_HOSTNAME_LENGTH {
            return Err(Error::InvalidArgument);
        }
        let frame = FrameBuilder::command(Opcode::GetHostByName)
            .u32(8)
            .u32(name.len() as u32)
            .bytes(name.as_bytes())
            .finish()?;
        let reply = self.command(frame, Opcode::GetHostByName).await?;
        check(&reply)?;
        let mut args = reply.reader();
        let _status = args.i32()?;
        let ip = args.ip()?;
        debug!("Resolved {} to {:?}.", name, ip.octets());
        Ok(ip)
    }
}

/// Program static addressing, or DHCP if there is none.
fn dhcp_frame(settings: Option<IpSettings>) -> Result<crate::hci::TxFrame> {
    let settings = settings.unwrap_or(IpSettings {
        ip: Ipv4Addr::UNSPECIFIED,
        mask: Ipv4Addr::UNSPECIFIED,
        gateway: Ipv4Addr::UNSPECIFIED,
        dns: Ipv4Addr::UNSPECIFIED,
    });
    FrameBuilder::command(Opcode::NetappDhcp)
        .bytes(&crate::hci::ip_to_wire(settings.ip))
        .bytes(&crate::hci::ip_to_wire(settings.mask))
        .bytes(&crate::hci::ip_to_wire(settings.gateway))
        .u32(0)
        .bytes(&crate::hci::ip_to_wire(settings.dns))
        .finish()
}
