//! A simulated CC3000.
//!
//! The model speaks the same SPI and HCI framing as the real chip, so the whole driver can be
//! exercised on the host. Its behaviour is scripted through the public fields of [ChipModel] and
//! the helpers, that inject unsolicited events.

use core::{
    convert::Infallible,
    future::{poll_fn, Future},
    net::{Ipv4Addr, SocketAddrV4},
    task::{Poll, Waker},
};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    mem,
    rc::Rc,
    string::{String, ToString},
    vec,
    vec::Vec,
};

use embassy_futures::select::{select, Either};
use embassy_time::Duration;
use embedded_hal::{
    digital::{self, InputPin, OutputPin},
    spi,
};
use embedded_hal_async::{digital::Wait, spi::SpiBus};

use crate::{
    hci::{decode_sockaddr, encode_sockaddr, ip_to_wire, SOCKADDR_SIZE},
    Cc3000, Config, Result, Runner, State,
};

pub const HOME_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
pub const PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 5353);

/// An access point, that can be linked to.
pub struct Network {
    pub ssid: String,
    pub key: String,
    /// Complete DHCP after the link came up.
    pub dhcp: bool,
}

/// A scan result, as the chip reports it.
pub struct ScanRecord {
    pub ssid: &'static str,
    pub raw_rssi: u8,
    pub security: u8,
    pub valid: bool,
}

pub struct ChipModel {
    powered: bool,
    cs: bool,
    booted: bool,
    incoming: Vec<u8>,
    reading: Option<(Vec<u8>, usize)>,
    outbound: VecDeque<Vec<u8>>,
    irq_waker: Option<Waker>,

    /// Never signal readiness.
    pub unresponsive: bool,
    pub buffers: u8,
    pub network: Option<Network>,
    associated: Option<String>,
    static_ip: Option<Ipv4Addr>,
    ip: Ipv4Addr,
    pub scan_results: VecDeque<ScanRecord>,
    pub reachable: Vec<SocketAddrV4>,
    pub hosts: HashMap<&'static str, Ipv4Addr>,
    next_socket: i32,
    pub open_sockets: Vec<i32>,
    /// The most bytes taken from a single data frame.
    pub send_limit: usize,
    pub sent: HashMap<i32, Vec<u8>>,
    inbound: HashMap<i32, VecDeque<u8>>,
    /// Sockets, whose peer closed the connection.
    hung_up: HashSet<i32>,
    /// Take data frames without answering, until [ChipModel::release_held_sends].
    pub hold_sends: bool,
    held_sends: Vec<(i32, u16, usize)>,
    /// An event sent ahead of the reply to the next command with the first opcode.
    interjection: Option<(u16, u16, Vec<u8>)>,
    pending_recv: HashMap<i32, (u16, usize)>,
    pending_accept: HashSet<i32>,
    ready_connections: VecDeque<(i32, SocketAddrV4)>,
    /// Every command opcode received, in order.
    pub commands: Vec<u16>,
    /// The arguments of the last command with each opcode.
    pub last_args: HashMap<u16, Vec<u8>>,
}
impl ChipModel {
    pub fn new() -> Self {
        Self {
            powered: false,
            cs: false,
            booted: false,
            incoming: Vec::new(),
            reading: None,
            outbound: VecDeque::new(),
            irq_waker: None,
            unresponsive: false,
            buffers: 6,
            network: None,
            associated: None,
            static_ip: None,
            ip: Ipv4Addr::UNSPECIFIED,
            scan_results: VecDeque::new(),
            reachable: Vec::new(),
            hosts: HashMap::new(),
            next_socket: 1,
            open_sockets: Vec::new(),
            send_limit: usize::MAX,
            sent: HashMap::new(),
            inbound: HashMap::new(),
            hung_up: HashSet::new(),
            hold_sends: false,
            held_sends: Vec::new(),
            interjection: None,
            pending_recv: HashMap::new(),
            pending_accept: HashSet::new(),
            ready_connections: VecDeque::new(),
            commands: Vec::new(),
            last_args: HashMap::new(),
        }
    }
    pub fn with_network(ssid: &str, key: &str) -> Self {
        Self {
            network: Some(Network {
                ssid: ssid.to_string(),
                key: key.to_string(),
                dhcp: true,
            }),
            ..Self::new()
        }
    }
    pub fn powered(&self) -> bool {
        self.powered
    }
    fn irq_low(&self) -> bool {
        self.powered && !self.unresponsive && (!self.booted || self.cs || !self.outbound.is_empty())
    }
    fn wake(&mut self) {
        if let Some(waker) = self.irq_waker.take() {
            waker.wake();
        }
    }
    fn power(&mut self, on: bool) {
        self.powered = on;
        self.booted = false;
        self.incoming.clear();
        self.reading = None;
        self.outbound.clear();
        self.associated = None;
        self.open_sockets.clear();
        self.hung_up.clear();
        self.held_sends.clear();
        self.pending_recv.clear();
        self.pending_accept.clear();
        self.wake();
    }

    /// Queue an event with status zero.
    pub fn event(&mut self, opcode: u16, args: &[u8]) {
        let mut packet = vec![0x04];
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(args.len() as u8 + 1);
        packet.push(0);
        packet.extend_from_slice(args);
        self.outbound.push_back(packet);
        self.wake();
    }
    fn data(&mut self, opcode: u8, args: &[u8], payload: &[u8]) {
        let mut packet = vec![0x02, opcode, args.len() as u8];
        packet.extend_from_slice(&((args.len() + payload.len()) as u16).to_le_bytes());
        packet.extend_from_slice(args);
        packet.extend_from_slice(payload);
        self.outbound.push_back(packet);
        self.wake();
    }
    /// Queue a raw HCI packet.
    pub fn raw(&mut self, packet: &[u8]) {
        self.outbound.push_back(packet.to_vec());
        self.wake();
    }

    /// Make data from the peer available on a socket.
    pub fn push_data(&mut self, sd: i32, data: &[u8]) {
        self.inbound.entry(sd).or_default().extend(data);
        if let Some((opcode, length)) = self.pending_recv.remove(&sd) {
            self.respond_recv(sd, opcode, length);
        }
    }
    /// The peer closed the connection.
    pub fn peer_close(&mut self, sd: i32) {
        self.hung_up.insert(sd);
        self.event(0x4800, &sd.to_le_bytes());
    }
    /// Send an event right before the reply to the next `trigger` command.
    pub fn interject(&mut self, trigger: u16, opcode: u16, args: &[u8]) {
        self.interjection = Some((trigger, opcode, args.to_vec()));
    }
    /// Answer every data frame taken while [ChipModel::hold_sends] was set and free its buffer.
    pub fn release_held_sends(&mut self) {
        self.hold_sends = false;
        for (sd, reply_opcode, taken) in mem::take(&mut self.held_sends) {
            self.send_done(sd, reply_opcode, taken);
        }
    }
    /// The access point dropped us.
    pub fn drop_link(&mut self) {
        self.associated = None;
        self.event(0x4002, &[]);
    }
    /// A peer connects to a listening socket.
    pub fn connect_peer(&mut self, listener: i32, addr: SocketAddrV4) {
        let sd = self.allocate_socket();
        if self.pending_accept.remove(&listener) {
            self.event(0x1005, &accept_args(listener, sd, addr));
        } else {
            self.ready_connections.push_back((sd, addr));
        }
    }

    fn allocate_socket(&mut self) -> i32 {
        let sd = self.next_socket;
        self.next_socket += 1;
        self.open_sockets.push(sd);
        sd
    }
    fn respond_recv(&mut self, sd: i32, opcode: u16, length: usize) {
        let queue = self.inbound.entry(sd).or_default();
        let count = length.min(queue.len());
        let taken: Vec<u8> = queue.drain(..count).collect();
        let mut reply = Vec::new();
        reply.extend_from_slice(&sd.to_le_bytes());
        reply.extend_from_slice(&(taken.len() as i32).to_le_bytes());
        reply.extend_from_slice(&0u32.to_le_bytes());
        self.event(opcode, &reply);
        if taken.is_empty() {
            return;
        }
        let (data_opcode, args) = if opcode == 0x100d {
            let mut args = reply.clone();
            args.extend_from_slice(&encode_sockaddr(PEER));
            (0x84, args)
        } else {
            (0x85, reply)
        };
        self.data(data_opcode, &args, &taken);
    }

    fn write(&mut self, words: &[u8]) {
        assert!(self.cs, "Write without chip select.");
        self.incoming.extend_from_slice(words);
        if self.incoming.len() < 5 {
            return;
        }
        assert_eq!(self.incoming[0], 0x01, "Not a write header.");
        let length = u16::from_be_bytes([self.incoming[1], self.incoming[2]]) as usize;
        if self.incoming.len() < 5 + length {
            return;
        }
        let frame = mem::take(&mut self.incoming);
        assert_eq!(length % 2, 1, "HCI packet isn't padded to an odd length.");
        self.booted = true;
        self.packet(&frame[5..5 + length]);
    }
    fn read(&mut self, words: &mut [u8]) {
        assert!(self.cs, "Read without chip select.");
        if self.reading.is_none() {
            assert_eq!(words[0], 0x03, "Not a read header.");
            let packet = self.outbound.pop_front().unwrap_or_default();
            let mut data = vec![0x02, 0, 0];
            data.extend_from_slice(&(packet.len() as u16).to_be_bytes());
            data.extend_from_slice(&packet);
            self.reading = Some((data, 0));
        }
        if let Some((data, cursor)) = self.reading.as_mut() {
            for word in words.iter_mut() {
                *word = data.get(*cursor).copied().unwrap_or(0);
                *cursor += 1;
            }
        }
    }
    fn packet(&mut self, packet: &[u8]) {
        match packet[0] {
            0x01 => {
                let opcode = u16::from_le_bytes([packet[1], packet[2]]);
                let args = packet[4..4 + packet[3] as usize].to_vec();
                self.commands.push(opcode);
                self.last_args.insert(opcode, args.clone());
                self.command(opcode, &args);
            }
            0x02 => {
                let args_length = packet[2] as usize;
                let total = u16::from_le_bytes([packet[3], packet[4]]) as usize;
                let args = packet[5..5 + args_length].to_vec();
                let payload = packet[5 + args_length..5 + total].to_vec();
                self.data_frame(packet[1], &args, &payload);
            }
            other => panic!("Unexpected packet type {other:#x}."),
        }
    }
    fn reply_i32(&mut self, opcode: u16, value: i32) {
        self.event(opcode, &value.to_le_bytes());
    }
    fn command(&mut self, opcode: u16, args: &[u8]) {
        if let Some((trigger, event, event_args)) = self.interjection.take() {
            if trigger == opcode {
                self.event(event, &event_args);
            } else {
                self.interjection = Some((trigger, event, event_args));
            }
        }
        let word = |index: usize| {
            u32::from_le_bytes(args[index * 4..index * 4 + 4].try_into().unwrap())
        };
        match opcode {
            // Simple link start.
            0x4000 => self.event(opcode, &[]),
            // Read buffer size.
            0x400b => {
                let mut reply = vec![self.buffers];
                reply.extend_from_slice(&1468u16.to_le_bytes());
                self.event(opcode, &reply);
            }
            // Connection policy, scan parameters, timers, bind, listen and setsockopt.
            0x0004 | 0x0003 | 0x2009 | 0x1002 | 0x1006 | 0x1009 => self.reply_i32(opcode, 0),
            // DHCP.
            0x2001 => {
                let ip = Ipv4Addr::from(word(0));
                self.static_ip = (!ip.is_unspecified()).then_some(ip);
                self.reply_i32(opcode, 0);
            }
            // Connect.
            0x0001 => {
                let ssid_length = word(1) as usize;
                let key_length = word(4) as usize;
                let ssid = String::from_utf8(args[28..28 + ssid_length].to_vec()).unwrap();
                let key = &args[28 + ssid_length..28 + ssid_length + key_length];
                self.reply_i32(opcode, 0);
                let Some(network) = self.network.as_ref() else {
                    return;
                };
                if network.ssid != ssid {
                    return;
                }
                if network.key.as_bytes() != key {
                    self.event(0x4002, &[]);
                    return;
                }
                let dhcp = network.dhcp;
                self.associated = Some(ssid);
                self.event(0x4001, &[]);
                if dhcp {
                    self.ip = self.static_ip.unwrap_or(HOME_IP);
                    let mut lease = Vec::new();
                    for ip in [
                        self.ip,
                        Ipv4Addr::new(255, 255, 255, 0),
                        Ipv4Addr::new(10, 0, 0, 1),
                        Ipv4Addr::new(10, 0, 0, 1),
                        Ipv4Addr::new(10, 0, 0, 1),
                    ] {
                        lease.extend_from_slice(&ip_to_wire(ip));
                    }
                    lease.push(0);
                    self.event(0x4010, &lease);
                }
            }
            // Disconnect.
            0x0002 => {
                self.reply_i32(opcode, 0);
                if self.associated.take().is_some() {
                    self.event(0x4002, &[]);
                }
            }
            // IP configuration.
            0x2005 => {
                let mut reply = Vec::new();
                for ip in [
                    self.ip,
                    Ipv4Addr::new(255, 255, 255, 0),
                    Ipv4Addr::new(10, 0, 0, 1),
                    Ipv4Addr::new(10, 0, 0, 1),
                    Ipv4Addr::new(10, 0, 0, 1),
                ] {
                    reply.extend_from_slice(&ip_to_wire(ip));
                }
                reply.extend_from_slice(&[0x08, 0x00, 0x28, 0x01, 0x02, 0x03]);
                let mut ssid = [0u8; 32];
                if let Some(associated) = self.associated.as_ref() {
                    ssid[..associated.len()].copy_from_slice(associated.as_bytes());
                }
                reply.extend_from_slice(&ssid);
                self.event(opcode, &reply);
            }
            // Scan results.
            0x0007 => {
                let remaining = self.scan_results.len() as u32;
                let mut reply = Vec::new();
                reply.extend_from_slice(&remaining.to_le_bytes());
                match self.scan_results.pop_front() {
                    Some(record) => {
                        reply.extend_from_slice(&1u32.to_le_bytes());
                        reply.push((record.raw_rssi << 1) | record.valid as u8);
                        reply.push(((record.ssid.len() as u8) << 2) | record.security);
                        reply.extend_from_slice(&0u16.to_le_bytes());
                        let mut ssid = [0u8; 32];
                        ssid[..record.ssid.len()].copy_from_slice(record.ssid.as_bytes());
                        reply.extend_from_slice(&ssid);
                        reply.extend_from_slice(&[0, 1, 2, 3, 4, remaining as u8]);
                    }
                    None => {
                        reply.extend_from_slice(&2u32.to_le_bytes());
                        reply.extend_from_slice(&[0; 2 + 2 + 32 + 6]);
                    }
                }
                self.event(opcode, &reply);
            }
            // Resolve a host name.
            0x1010 => {
                let length = word(1) as usize;
                let name = std::str::from_utf8(&args[8..8 + length]).unwrap();
                let mut reply = Vec::new();
                match self.hosts.get(name) {
                    Some(ip) => {
                        reply.extend_from_slice(&0i32.to_le_bytes());
                        reply.extend_from_slice(&ip_to_wire(*ip));
                    }
                    None => {
                        reply.extend_from_slice(&(-1i32).to_le_bytes());
                        reply.extend_from_slice(&[0; 4]);
                    }
                }
                self.event(opcode, &reply);
            }
            // Socket.
            0x1001 => {
                let sd = if self.open_sockets.len() >= 8 {
                    -1
                } else {
                    self.allocate_socket()
                };
                self.reply_i32(opcode, sd);
            }
            // Close socket.
            0x100b => {
                let sd = word(0) as i32;
                self.open_sockets.retain(|open| *open != sd);
                self.pending_recv.remove(&sd);
                self.pending_accept.remove(&sd);
                self.reply_i32(opcode, 0);
            }
            // Connect. Unreachable peers never answer.
            0x1007 => {
                let addr = decode_sockaddr(args[12..12 + SOCKADDR_SIZE].try_into().unwrap());
                if self.reachable.contains(&addr) {
                    self.reply_i32(opcode, 0);
                }
            }
            // Accept.
            0x1005 => {
                let sd = word(0) as i32;
                match self.ready_connections.pop_front() {
                    Some((accepted, addr)) => self.event(opcode, &accept_args(sd, accepted, addr)),
                    None => {
                        self.pending_accept.insert(sd);
                        self.event(
                            opcode,
                            &accept_args(sd, -2, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
                        );
                    }
                }
            }
            // Select, only the read set is evaluated.
            0x1008 => {
                let requested = word(6);
                let readable = (0..32)
                    .filter(|sd| requested & (1u32 << sd) != 0)
                    .filter(|sd| self.readable(*sd))
                    .fold(0u32, |set, sd| set | (1u32 << sd));
                let mut reply = Vec::new();
                reply.extend_from_slice(&(readable.count_ones() as i32).to_le_bytes());
                reply.extend_from_slice(&readable.to_le_bytes());
                reply.extend_from_slice(&[0; 8]);
                self.event(opcode, &reply);
            }
            // Receive. The reply is held back until there is data.
            0x1004 | 0x100d => {
                let sd = word(0) as i32;
                let length = word(1) as usize;
                if self.readable(sd) {
                    self.respond_recv(sd, opcode, length);
                } else {
                    self.pending_recv.insert(sd, (opcode, length));
                }
            }
            other => panic!("Unexpected command {other:#x}."),
        }
    }
    fn readable(&self, sd: i32) -> bool {
        self.hung_up.contains(&sd) || self.inbound.get(&sd).is_some_and(|queue| !queue.is_empty())
    }
    fn data_frame(&mut self, opcode: u8, args: &[u8], payload: &[u8]) {
        let sd = i32::from_le_bytes(args[0..4].try_into().unwrap());
        let taken = payload.len().min(self.send_limit);
        self.sent
            .entry(sd)
            .or_default()
            .extend_from_slice(&payload[..taken]);
        let reply_opcode = match opcode {
            0x81 => 0x1003,
            0x83 => 0x100f,
            other => panic!("Unexpected data opcode {other:#x}."),
        };
        if self.hold_sends {
            self.held_sends.push((sd, reply_opcode, taken));
            return;
        }
        self.send_done(sd, reply_opcode, taken);
    }
    fn send_done(&mut self, sd: i32, reply_opcode: u16, taken: usize) {
        let mut reply = Vec::new();
        reply.extend_from_slice(&sd.to_le_bytes());
        reply.extend_from_slice(&(taken as i32).to_le_bytes());
        self.event(reply_opcode, &reply);
        let mut freed = Vec::new();
        freed.extend_from_slice(&1u16.to_le_bytes());
        freed.extend_from_slice(&(sd as u16).to_le_bytes());
        freed.extend_from_slice(&1u16.to_le_bytes());
        self.event(0x4100, &freed);
    }
}

fn accept_args(listener: i32, accepted: i32, addr: SocketAddrV4) -> Vec<u8> {
    let mut args = Vec::new();
    args.extend_from_slice(&listener.to_le_bytes());
    args.extend_from_slice(&accepted.to_le_bytes());
    args.extend_from_slice(&encode_sockaddr(addr));
    args
}

pub type Chip = Rc<RefCell<ChipModel>>;

pub struct Spi(Chip);
impl spi::ErrorType for Spi {
    type Error = Infallible;
}
impl SpiBus<u8> for Spi {
    async fn read(&mut self, words: &mut [u8]) -> core::result::Result<(), Infallible> {
        words.fill(0);
        self.0.borrow_mut().read(words);
        Ok(())
    }
    async fn write(&mut self, words: &[u8]) -> core::result::Result<(), Infallible> {
        self.0.borrow_mut().write(words);
        Ok(())
    }
    async fn transfer(
        &mut self,
        read: &mut [u8],
        write: &[u8],
    ) -> core::result::Result<(), Infallible> {
        read.fill(0);
        let shared = read.len().min(write.len());
        read[..shared].copy_from_slice(&write[..shared]);
        self.0.borrow_mut().read(read);
        Ok(())
    }
    async fn transfer_in_place(
        &mut self,
        words: &mut [u8],
    ) -> core::result::Result<(), Infallible> {
        self.0.borrow_mut().read(words);
        Ok(())
    }
    async fn flush(&mut self) -> core::result::Result<(), Infallible> {
        Ok(())
    }
}

pub struct ChipSelect(Chip);
impl digital::ErrorType for ChipSelect {
    type Error = Infallible;
}
impl OutputPin for ChipSelect {
    fn set_low(&mut self) -> core::result::Result<(), Infallible> {
        let mut chip = self.0.borrow_mut();
        chip.cs = true;
        chip.incoming.clear();
        chip.reading = None;
        chip.wake();
        Ok(())
    }
    fn set_high(&mut self) -> core::result::Result<(), Infallible> {
        let mut chip = self.0.borrow_mut();
        chip.cs = false;
        chip.reading = None;
        chip.wake();
        Ok(())
    }
}

pub struct Enable(Chip);
impl digital::ErrorType for Enable {
    type Error = Infallible;
}
impl OutputPin for Enable {
    fn set_low(&mut self) -> core::result::Result<(), Infallible> {
        self.0.borrow_mut().power(false);
        Ok(())
    }
    fn set_high(&mut self) -> core::result::Result<(), Infallible> {
        self.0.borrow_mut().power(true);
        Ok(())
    }
}

pub struct Irq(Chip);
impl Irq {
    async fn wait_for_level(&mut self, low: bool) {
        poll_fn(|cx| {
            let mut chip = self.0.borrow_mut();
            if chip.irq_low() == low {
                Poll::Ready(())
            } else {
                chip.irq_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }
}
impl digital::ErrorType for Irq {
    type Error = Infallible;
}
impl InputPin for Irq {
    fn is_high(&mut self) -> core::result::Result<bool, Infallible> {
        Ok(!self.0.borrow().irq_low())
    }
    fn is_low(&mut self) -> core::result::Result<bool, Infallible> {
        Ok(self.0.borrow().irq_low())
    }
}
impl Wait for Irq {
    async fn wait_for_high(&mut self) -> core::result::Result<(), Infallible> {
        self.wait_for_level(false).await;
        Ok(())
    }
    async fn wait_for_low(&mut self) -> core::result::Result<(), Infallible> {
        self.wait_for_level(true).await;
        Ok(())
    }
    async fn wait_for_rising_edge(&mut self) -> core::result::Result<(), Infallible> {
        self.wait_for_level(false).await;
        Ok(())
    }
    async fn wait_for_falling_edge(&mut self) -> core::result::Result<(), Infallible> {
        self.wait_for_level(true).await;
        Ok(())
    }
    async fn wait_for_any_edge(&mut self) -> core::result::Result<(), Infallible> {
        self.wait_for_level(true).await;
        Ok(())
    }
}

/// The bus and pins of a simulated chip.
pub struct Parts {
    pub spi: Spi,
    pub cs: ChipSelect,
    pub wen: Enable,
    pub irq: Irq,
}
impl Parts {
    pub async fn init(
        self,
        state: &State,
    ) -> Result<(Cc3000<'_>, Runner<'_, Spi, ChipSelect, Enable, Irq>)> {
        crate::init(state, self.spi, self.cs, self.wen, self.irq, test_config()).await
    }
}

pub fn chip(model: ChipModel) -> (Chip, Parts) {
    let chip = Rc::new(RefCell::new(model));
    let parts = Parts {
        spi: Spi(chip.clone()),
        cs: ChipSelect(chip.clone()),
        wen: Enable(chip.clone()),
        irq: Irq(chip.clone()),
    };
    (chip, parts)
}

pub fn test_config() -> Config {
    Config {
        boot_timeout: Duration::from_millis(100),
        power_down_settle: Duration::from_millis(1),
        first_write_delay: Duration::from_millis(0),
        command_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(100),
        link_timeout: Duration::from_millis(200),
        dhcp_timeout: Duration::from_millis(200),
        recv_timeout: Duration::from_millis(100),
        accept_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    }
}

/// Poll the runner alongside `body`, until `body` completes.
pub async fn drive<R: Future, T>(runner: R, body: impl Future<Output = T>) -> T {
    match select(runner, body).await {
        Either::First(_) => unreachable!("The runner never returns."),
        Either::Second(value) => value,
    }
}
