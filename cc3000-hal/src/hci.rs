//! Framing of HCI packets on top of the CC3000 SPI protocol.
//!
//! Every transfer starts with a five byte SPI header. For writes this is
//! `[WRITE, len_hi, len_lo, 0, 0]`, for reads the host clocks out `[READ, 0, 0]` and the chip
//! answers with its own header, carrying the length in the last two bytes. The HCI packet, that
//! follows, is padded to an odd length, so the complete transfer has an even length.

use core::net::{Ipv4Addr, SocketAddrV4};

use heapless::Vec;
use macro_bits::serializable_enum;

use crate::{Error, Result};

pub const SPI_HEADER_SIZE: usize = 5;
/// Size of the command and event headers, excluding the status byte of events.
pub const HCI_HEADER_SIZE: usize = 5;
/// The part of a frame, that has to be read before the remaining length is known.
pub const READ_HEADER_SIZE: usize = SPI_HEADER_SIZE + HCI_HEADER_SIZE;
pub const TX_BUFFER_SIZE: usize = 1536;
pub const RX_BUFFER_SIZE: usize = 1536;
/// The largest argument block we keep from a reply.
pub const MAX_REPLY_ARGS: usize = 64;
/// The size of a BSD `sockaddr` on the wire.
pub const SOCKADDR_SIZE: usize = 16;

pub const SPI_OP_WRITE: u8 = 0x01;
pub const SPI_OP_READ: u8 = 0x03;
pub const SPI_OP_REPLY: u8 = 0x02;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// The type of an HCI packet.
    pub enum PacketType: u8 {
        Command => 0x01,
        Data => 0x02,
        Patch => 0x03,
        Event => 0x04
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Opcodes of commands and events.
    ///
    /// The reply to a command carries the opcode of the command itself.
    pub enum Opcode: u16 {
        WlanConnect => 0x0001,
        WlanDisconnect => 0x0002,
        WlanSetScanParams => 0x0003,
        WlanSetConnectionPolicy => 0x0004,
        WlanGetScanResults => 0x0007,
        Socket => 0x1001,
        Bind => 0x1002,
        Send => 0x1003,
        Recv => 0x1004,
        Accept => 0x1005,
        Listen => 0x1006,
        Connect => 0x1007,
        Select => 0x1008,
        SetSockOpt => 0x1009,
        CloseSocket => 0x100b,
        RecvFrom => 0x100d,
        SendTo => 0x100f,
        GetHostByName => 0x1010,
        NetappDhcp => 0x2001,
        NetappIpConfig => 0x2005,
        NetappSetTimers => 0x2009,
        SimpleLinkStart => 0x4000,
        WlanUnsolConnect => 0x4001,
        WlanUnsolDisconnect => 0x4002,
        WlanUnsolInit => 0x4004,
        WlanTxComplete => 0x4008,
        WlanUnsolDhcp => 0x4010,
        WlanKeepalive => 0x4200,
        BsdTcpCloseWait => 0x4800,
        ReadBufferSize => 0x400b,
        DataUnsolFreeBuff => 0x4100,
        CanShutDown => 0x0099
    }
}

impl Opcode {
    /// Commands operating on a socket. These are failed when the link goes away.
    pub const fn is_socket_operation(self) -> bool {
        matches!(
            self,
            Self::Bind
                | Self::Send
                | Self::Recv
                | Self::Accept
                | Self::Listen
                | Self::Connect
                | Self::SetSockOpt
                | Self::RecvFrom
                | Self::SendTo
        )
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Opcodes of data packets.
    pub enum DataOpcode: u8 {
        Send => 0x81,
        SendTo => 0x83,
        RecvFrom => 0x84,
        Recv => 0x85
    }
}

/// A frame ready to be clocked out, including the SPI header.
pub type TxFrame = Vec<u8, TX_BUFFER_SIZE>;

/// Builds an outgoing frame.
///
/// Running out of space is remembered and reported by [FrameBuilder::finish], so arguments can
/// be chained without checking every single one.
pub struct FrameBuilder {
    frame: TxFrame,
    packet_type: PacketType,
    payload_start: Option<usize>,
    overflow: bool,
}
impl FrameBuilder {
    fn new(
        header: [u8; SPI_HEADER_SIZE + HCI_HEADER_SIZE],
        packet_type: PacketType,
        len: usize,
    ) -> Self {
        let mut frame = TxFrame::new();
        // The header always fits.
        let _ = frame.extend_from_slice(&header[..len]);
        Self {
            frame,
            packet_type,
            payload_start: None,
            overflow: false,
        }
    }
    /// Start a command frame.
    pub fn command(opcode: Opcode) -> Self {
        let [lo, hi] = opcode.into_bits().to_le_bytes();
        Self::new(
            [0, 0, 0, 0, 0, PacketType::Command.into_bits(), lo, hi, 0, 0],
            PacketType::Command,
            SPI_HEADER_SIZE + 4,
        )
    }
    /// Start a data frame.
    pub fn data(opcode: DataOpcode) -> Self {
        Self::new(
            [0, 0, 0, 0, 0, PacketType::Data.into_bits(), opcode.into_bits(), 0, 0, 0],
            PacketType::Data,
            SPI_HEADER_SIZE + HCI_HEADER_SIZE,
        )
    }
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        if self.frame.extend_from_slice(bytes).is_err() {
            self.overflow = true;
        }
        self
    }
    pub fn u8(self, value: u8) -> Self {
        self.bytes(&[value])
    }
    pub fn u16(self, value: u16) -> Self {
        self.bytes(&value.to_le_bytes())
    }
    pub fn u32(self, value: u32) -> Self {
        self.bytes(&value.to_le_bytes())
    }
    pub fn i32(self, value: i32) -> Self {
        self.bytes(&value.to_le_bytes())
    }
    pub fn sockaddr(self, addr: SocketAddrV4) -> Self {
        self.bytes(&encode_sockaddr(addr))
    }
    /// Append the payload of a data frame. Everything before it counts as arguments.
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload_start = Some(self.frame.len());
        self.bytes(payload)
    }
    /// Fill in the length fields, pad the packet and write the SPI header.
    pub fn finish(mut self) -> Result<TxFrame> {
        if self.overflow {
            return Err(Error::InvalidArgument);
        }
        let args_start = match self.packet_type {
            PacketType::Command => SPI_HEADER_SIZE + 4,
            _ => SPI_HEADER_SIZE + HCI_HEADER_SIZE,
        };
        let end = self.frame.len();
        let args_end = self.payload_start.unwrap_or(end);
        let args_len = u8::try_from(args_end - args_start).map_err(|_| Error::InvalidArgument)?;
        match self.packet_type {
            PacketType::Command => self.frame[SPI_HEADER_SIZE + 3] = args_len,
            _ => {
                self.frame[SPI_HEADER_SIZE + 2] = args_len;
                let total = u16::try_from(end - args_start).map_err(|_| Error::InvalidArgument)?;
                self.frame[SPI_HEADER_SIZE + 3..SPI_HEADER_SIZE + 5]
                    .copy_from_slice(&total.to_le_bytes());
            }
        }
        // The chip expects an odd packet length.
        if (end - SPI_HEADER_SIZE) % 2 == 0 && self.frame.push(0).is_err() {
            return Err(Error::InvalidArgument);
        }
        let [hi, lo] = ((self.frame.len() - SPI_HEADER_SIZE) as u16).to_be_bytes();
        self.frame[..SPI_HEADER_SIZE].copy_from_slice(&[SPI_OP_WRITE, hi, lo, 0, 0]);
        Ok(self.frame)
    }
}

/// Extract the packet length from the header of a read transfer.
pub fn spi_read_length(header: &[u8]) -> Result<usize> {
    match header {
        [SPI_OP_REPLY, _, _, hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo]) as usize),
        _ => Err(Error::Protocol),
    }
}

/// A frame received from the chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Event {
        opcode: u16,
        status: u8,
        args: &'a [u8],
    },
    Data {
        opcode: u8,
        args: &'a [u8],
        payload: &'a [u8],
    },
}

/// Classify a received HCI packet. Trailing padding is ignored.
pub fn decode_frame(packet: &[u8]) -> Result<Frame<'_>> {
    let Some((&packet_type, _)) = packet.split_first() else {
        return Err(Error::Protocol);
    };
    match PacketType::from_bits(packet_type) {
        PacketType::Event => {
            let [_, lo, hi, len, status, ..] = *packet else {
                return Err(Error::Protocol);
            };
            // The length covers the status byte as well.
            let args_len = (len as usize).checked_sub(1).ok_or(Error::Protocol)?;
            let args = packet
                .get(HCI_HEADER_SIZE..HCI_HEADER_SIZE + args_len)
                .ok_or(Error::Protocol)?;
            Ok(Frame::Event {
                opcode: u16::from_le_bytes([lo, hi]),
                status,
                args,
            })
        }
        PacketType::Data => {
            let [_, opcode, args_len, lo, hi, ..] = *packet else {
                return Err(Error::Protocol);
            };
            let total = u16::from_le_bytes([lo, hi]) as usize;
            let args_len = args_len as usize;
            if args_len > total {
                return Err(Error::Protocol);
            }
            let body = packet
                .get(HCI_HEADER_SIZE..HCI_HEADER_SIZE + total)
                .ok_or(Error::Protocol)?;
            let (args, payload) = body.split_at(args_len);
            Ok(Frame::Data {
                opcode,
                args,
                payload,
            })
        }
        _ => Err(Error::Protocol),
    }
}

/// The reply to a command, copied out of the receive buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub opcode: u16,
    pub status: u8,
    pub args: Vec<u8, MAX_REPLY_ARGS>,
}
impl Reply {
    pub fn new(opcode: u16, status: u8, args: &[u8]) -> Result<Self> {
        Ok(Self {
            opcode,
            status,
            args: Vec::from_slice(args).map_err(|_| Error::Protocol)?,
        })
    }
    pub fn reader(&self) -> ArgReader<'_> {
        ArgReader::new(&self.args)
    }
    /// The first argument interpreted as the return value of a BSD style call.
    pub fn retval(&self) -> Result<i32> {
        if self.status != 0 {
            return Err(Error::Io(-(self.status as i32)));
        }
        self.reader().i32()
    }
}

/// Reads little endian arguments out of a reply or event.
pub struct ArgReader<'a> {
    args: &'a [u8],
}
impl<'a> ArgReader<'a> {
    pub const fn new(args: &'a [u8]) -> Self {
        Self { args }
    }
    pub fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let (head, tail) = self.args.split_first_chunk::<N>().ok_or(Error::Protocol)?;
        self.args = tail;
        Ok(*head)
    }
    pub fn u8(&mut self) -> Result<u8> {
        self.bytes::<1>().map(|[value]| value)
    }
    pub fn u16(&mut self) -> Result<u16> {
        self.bytes().map(u16::from_le_bytes)
    }
    pub fn u32(&mut self) -> Result<u32> {
        self.bytes().map(u32::from_le_bytes)
    }
    pub fn i32(&mut self) -> Result<i32> {
        self.bytes().map(i32::from_le_bytes)
    }
    pub fn ip(&mut self) -> Result<Ipv4Addr> {
        self.bytes().map(ip_from_wire)
    }
    pub fn sockaddr(&mut self) -> Result<SocketAddrV4> {
        self.bytes::<SOCKADDR_SIZE>().map(|raw| decode_sockaddr(&raw))
    }
}

/// The chip transfers IPv4 addresses as little endian words.
pub fn ip_from_wire(raw: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_le_bytes(raw))
}
pub fn ip_to_wire(ip: Ipv4Addr) -> [u8; 4] {
    u32::from(ip).to_le_bytes()
}

const AF_INET: u16 = 2;

pub fn encode_sockaddr(addr: SocketAddrV4) -> [u8; SOCKADDR_SIZE] {
    let mut raw = [0u8; SOCKADDR_SIZE];
    raw[0..2].copy_from_slice(&AF_INET.to_le_bytes());
    raw[2..4].copy_from_slice(&addr.port().to_be_bytes());
    raw[4..8].copy_from_slice(&addr.ip().octets());
    raw
}
pub fn decode_sockaddr(raw: &[u8; SOCKADDR_SIZE]) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]),
        u16::from_be_bytes([raw[2], raw[3]]),
    )
}
