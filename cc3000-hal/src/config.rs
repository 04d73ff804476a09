use embassy_time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Timeouts and limits used by the driver.
///
/// The defaults are chosen conservatively for the CC3000 firmware 1.13 and later.
pub struct Config {
    /// How long the chip may take to signal readiness after WEN was raised.
    pub boot_timeout: Duration,
    /// How long to hold WEN low before powering up, so the chip fully resets.
    pub power_down_settle: Duration,
    /// Maximum time between asserting chip select and the chip pulling IRQ low.
    ///
    /// Exceeding it leaves the link in an undefined state, so it's reported as a fatal
    /// [Error::Protocol](crate::Error::Protocol).
    pub turnaround_timeout: Duration,
    /// The pause inserted around the first four bytes of the first write after power up.
    pub first_write_delay: Duration,
    /// Timeout for replies to plain commands.
    pub command_timeout: Duration,
    /// Timeout for the reply to a socket connect.
    pub connect_timeout: Duration,
    /// How long to wait for the link-up event after issuing a connect.
    pub link_timeout: Duration,
    /// How long to wait for DHCP to complete once the link is up.
    pub dhcp_timeout: Duration,
    /// Default timeout for `recv_into` and `recvfrom_into`.
    pub recv_timeout: Duration,
    /// How often a blocked receive asks the chip for data. The command path is free in between.
    pub recv_poll_interval: Duration,
    /// Timeout for `accept`. `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// The largest payload put into a single data frame.
    pub max_send_chunk: usize,
    /// DHCP lease time in seconds.
    pub dhcp_lease: u32,
    /// ARP cache timeout in seconds.
    pub arp_timeout: u32,
    /// TCP keepalive interval in seconds.
    pub keepalive: u32,
    /// Socket inactivity timeout in seconds. Zero disables it.
    pub inactivity: u32,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_millis(1000),
            power_down_settle: Duration::from_millis(100),
            turnaround_timeout: Duration::from_millis(50),
            first_write_delay: Duration::from_millis(5),
            command_timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(10),
            link_timeout: Duration::from_secs(5),
            dhcp_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(5),
            recv_poll_interval: Duration::from_millis(5),
            accept_timeout: None,
            max_send_chunk: 1460,
            dhcp_lease: 14400,
            arp_timeout: 3600,
            keepalive: 30,
            inactivity: 0,
        }
    }
}
