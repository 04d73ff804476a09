use core::{cell::Cell, future::Future, net::SocketAddrV4};

use embassy_futures::select::{select, Either};
use embassy_sync::{
    blocking_mutex,
    channel::Channel,
    mutex::{Mutex, MutexGuard},
    signal::Signal,
};
use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::{digital::Wait, spi::SpiBus};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    control::{IpSettings, LinkMonitor},
    hci::{DataOpcode, FrameBuilder, Opcode, Reply, TxFrame, SOCKADDR_SIZE},
    runner::{Request, Runner},
    socket::{Family, SocketHandle, SocketState, SocketTable, SocketType, SOC_IN_PROGRESS},
    sync::{BufferCredits, PendingReply},
    transport::Transport,
    Config, DefaultRawMutex, Error, Result,
};

/// The socket option level of the options below.
pub const SOL_SOCKET: u32 = 0xffff;
/// Make receive calls on the chip non blocking.
pub const SOCKOPT_RECV_NONBLOCK: u32 = 0;
/// The receive timeout in milliseconds. This also bounds [Cc3000::recv_into].
pub const SOCKOPT_RECV_TIMEOUT: u32 = 1;
/// Make accept calls on the chip non blocking.
pub const SOCKOPT_ACCEPT_NONBLOCK: u32 = 2;

/// The shortest select timeout the firmware honours, in microseconds.
const SELECT_MIN_TIMEOUT: u32 = 5000;
/// Offset of the descriptor sets in the select arguments.
const SELECT_SETS_OFFSET: u32 = 0x14;

/// Everything shared between the [Runner] and the [Cc3000] handles.
///
/// This has to outlive both, so it's usually placed in a `static`.
pub struct State {
    pub(crate) requests: Channel<DefaultRawMutex, Request, 1>,
    /// Completion of [Request::Reset] and [Request::Shutdown].
    pub(crate) lifecycle: Signal<DefaultRawMutex, Result<()>>,
    pub(crate) reply: PendingReply,
    command_lock: Mutex<DefaultRawMutex, ()>,
    pub(crate) link: LinkMonitor,
    pub(crate) sockets: SocketTable,
    pub(crate) credits: BufferCredits,
    pub(crate) static_ip: blocking_mutex::Mutex<DefaultRawMutex, Cell<Option<IpSettings>>>,
    fatal: AtomicBool,
}
impl State {
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            lifecycle: Signal::new(),
            reply: PendingReply::new(),
            command_lock: Mutex::new(()),
            link: LinkMonitor::new(),
            sockets: SocketTable::new(),
            credits: BufferCredits::new(),
            static_ip: blocking_mutex::Mutex::new(Cell::new(None)),
            fatal: AtomicBool::new(false),
        }
    }
    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }
    /// Forget everything the chip knew. Used before (re)starting it.
    pub(crate) fn reset(&self) {
        self.reply.disarm();
        self.sockets.clear();
        self.link.go_down();
        self.credits.reset(0);
        self.fatal.store(false, Ordering::Release);
    }
    /// The link to the chip is broken. Everything in flight fails and no new commands are accepted
    /// until the chip was reinitialized.
    pub(crate) fn invalidate(&self, error: Error) {
        self.fatal.store(true, Ordering::Release);
        self.reply.fail(error);
        self.sockets.close_all();
        self.link.go_down();
    }
}
impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the command path.
///
/// Only one command may be in flight, so this holds the command lock until dropped.
pub(crate) struct CommandChannel<'a> {
    state: &'a State,
    _lock: MutexGuard<'a, DefaultRawMutex, ()>,
}
impl CommandChannel<'_> {
    /// Hand the frame to the runner and wait for the reply with the `expected` opcode.
    pub async fn execute(
        &mut self,
        frame: TxFrame,
        expected: Opcode,
        timeout: Duration,
    ) -> Result<Reply> {
        self.issue(frame, expected, None, timeout).await
    }
    /// Like [execute](Self::execute), but only a reply concerning the chip's socket `hw` is
    /// accepted. A late reply for another socket can't complete the command this way.
    pub async fn execute_on(
        &mut self,
        frame: TxFrame,
        expected: Opcode,
        hw: i32,
        timeout: Duration,
    ) -> Result<Reply> {
        self.issue(frame, expected, Some(hw), timeout).await
    }
    async fn issue(
        &mut self,
        frame: TxFrame,
        expected: Opcode,
        hw: Option<i32>,
        timeout: Duration,
    ) -> Result<Reply> {
        if self.state.is_fatal() {
            return Err(Error::Protocol);
        }
        trace!("Issuing command {:#x}.", expected.into_bits());
        self.state.reply.arm(expected.into_bits(), hw);
        self.state.requests.send(Request::Frame(frame)).await;
        match with_timeout(timeout, self.state.reply.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.state.reply.disarm();
                debug!("Command {:#x} timed out.", expected.into_bits());
                Err(Error::Timeout)
            }
        }
    }
    /// Hand a lifecycle request to the runner and wait for it to complete.
    pub async fn lifecycle(&mut self, request: Request) -> Result<()> {
        self.state.lifecycle.reset();
        self.state.requests.send(request).await;
        self.state.lifecycle.wait().await
    }
}
impl Drop for CommandChannel<'_> {
    fn drop(&mut self) {
        // A reply arriving after the caller gave up is dropped as unsolicited.
        self.state.reply.disarm();
    }
}

/// Check the BSD style return value of a reply.
pub(crate) fn check(reply: &Reply) -> Result<i32> {
    match reply.retval()? {
        error if error < 0 => Err(Error::Io(error)),
        value => Ok(value),
    }
}

/// Bring up the CC3000.
///
/// This power cycles the chip and performs the start up handshake. Afterwards the [Runner] has to
/// be driven, for the returned [Cc3000] to make any progress.
pub async fn init<'a, SPI, CS, WEN, IRQ>(
    state: &'a State,
    spi: SPI,
    cs: CS,
    wen: WEN,
    irq: IRQ,
    config: Config,
) -> Result<(Cc3000<'a>, Runner<'a, SPI, CS, WEN, IRQ>)>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    WEN: OutputPin,
    IRQ: InputPin + Wait,
{
    let mut runner = Runner::new(state, Transport::new(spi, cs, wen, irq), config);
    runner.bring_up().await?;
    Ok((Cc3000 { state, config }, runner))
}

/// A handle to the CC3000.
///
/// This is cheap to copy, so every task can hold its own. Commands are serialized internally.
#[derive(Clone, Copy)]
pub struct Cc3000<'a> {
    pub(crate) state: &'a State,
    pub(crate) config: Config,
}
impl<'a> Cc3000<'a> {
    /// The configuration passed to [init].
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub(crate) async fn commands(&self) -> CommandChannel<'a> {
        CommandChannel {
            state: self.state,
            _lock: self.state.command_lock.lock().await,
        }
    }
    /// Execute a single command with the default timeout.
    pub(crate) async fn command(&self, frame: TxFrame, expected: Opcode) -> Result<Reply> {
        self.commands()
            .await
            .execute(frame, expected, self.config.command_timeout)
            .await
    }
    /// Run the bring-up sequence again.
    ///
    /// This is the only way to recover from [Error::Protocol]. All sockets are lost.
    pub async fn reinit(&self) -> Result<()> {
        info!("Reinitializing CC3000.");
        self.commands().await.lifecycle(Request::Reset).await
    }
    /// Power down the chip.
    ///
    /// All sockets are closed and the link goes down. The chip can be brought back with
    /// [Cc3000::reinit].
    pub async fn done(&self) -> Result<()> {
        info!("Shutting down CC3000.");
        self.commands().await.lifecycle(Request::Shutdown).await
    }

    /// Resolves once the socket was closed or released.
    fn closed(&self, handle: SocketHandle) -> impl Future<Output = ()> + 'a {
        self.state.sockets.wait(handle, |entry| match entry {
            Some(entry) if !entry.is_closed() => None,
            _ => Some(()),
        })
    }
    /// The chip's handle for an open socket.
    fn open_socket(&self, handle: SocketHandle) -> Result<i32> {
        self.state.sockets.with(handle, |entry| {
            if entry.is_closed() {
                Err(Error::ConnectionClosed)
            } else {
                Ok(entry.hw)
            }
        })?
    }
    /// Create a socket.
    ///
    /// A `protocol` of zero selects TCP for stream and UDP for datagram sockets.
    pub async fn socket(
        &self,
        family: Family,
        socket_type: SocketType,
        protocol: u32,
    ) -> Result<SocketHandle> {
        if family != Family::Inet {
            return Err(Error::Unsupported);
        }
        let reservation = self.state.sockets.reserve(socket_type)?;
        let protocol = match protocol {
            0 => socket_type.default_protocol(),
            protocol => protocol,
        };
        let frame = FrameBuilder::command(Opcode::Socket)
            .u32(Family::AF_INET)
            .u32(socket_type.into_bits() as u32)
            .u32(protocol)
            .finish()?;
        let hw = self.command(frame, Opcode::Socket).await?.retval()?;
        if hw < 0 {
            warn!("Chip refused to create a socket: {}", hw);
            return Err(Error::ResourceExhausted);
        }
        debug!("Created socket {}.", hw);
        Ok(reservation.commit(hw, SocketState::Created))
    }
    /// Set a socket option on the chip.
    pub async fn setsockopt(
        &self,
        handle: SocketHandle,
        level: u32,
        option: u32,
        value: u32,
    ) -> Result<()> {
        let hw = self.open_socket(handle)?;
        let frame = FrameBuilder::command(Opcode::SetSockOpt)
            .i32(hw)
            .u32(level)
            .u32(option)
            .u32(8)
            .u32(4)
            .u32(value)
            .finish()?;
        check(&self.command(frame, Opcode::SetSockOpt).await?)?;
        if level == SOL_SOCKET && option == SOCKOPT_RECV_TIMEOUT {
            self.state.sockets.with(handle, |entry| {
                entry.recv_timeout = Some(Duration::from_millis(value as u64))
            })?;
        }
        Ok(())
    }
    /// Close a socket.
    ///
    /// Closing a socket, that's already closed, does nothing. Anyone blocked on the socket is
    /// woken up with [Error::ConnectionClosed].
    pub async fn close(&self, handle: SocketHandle) -> Result<()> {
        let Some(hw) = self.state.sockets.release(handle) else {
            trace!("Socket was already closed.");
            return Ok(());
        };
        if self.state.is_fatal() {
            return Ok(());
        }
        let frame = FrameBuilder::command(Opcode::CloseSocket).i32(hw).finish()?;
        match self.command(frame, Opcode::CloseSocket).await {
            Ok(reply) => {
                if let Err(error) = check(&reply) {
                    debug!("Chip failed to close socket {}: {:?}", hw, error);
                }
            }
            Err(error) => warn!("Closing socket {} failed: {:?}", hw, error),
        }
        debug!("Closed socket {}.", hw);
        Ok(())
    }
    async fn address_command(
        &self,
        handle: SocketHandle,
        opcode: Opcode,
        addr: SocketAddrV4,
        timeout: Duration,
    ) -> Result<()> {
        let hw = self.open_socket(handle)?;
        let frame = FrameBuilder::command(opcode)
            .i32(hw)
            .u32(8)
            .u32(SOCKADDR_SIZE as u32)
            .sockaddr(addr)
            .finish()?;
        let reply = self.commands().await.execute(frame, opcode, timeout).await?;
        check(&reply).map(|_| ())
    }
    /// Bind the socket to a local address.
    pub async fn bind(&self, handle: SocketHandle, addr: SocketAddrV4) -> Result<()> {
        let _operation = self.state.sockets.begin(handle)?;
        self.address_command(handle, Opcode::Bind, addr, self.config.command_timeout)
            .await?;
        self.state
            .sockets
            .with(handle, |entry| entry.state = SocketState::Bound)
    }
    /// Listen for incoming connections.
    pub async fn listen(&self, handle: SocketHandle, backlog: u32) -> Result<()> {
        let _operation = self.state.sockets.begin(handle)?;
        let hw = self.open_socket(handle)?;
        let frame = FrameBuilder::command(Opcode::Listen)
            .i32(hw)
            .u32(backlog)
            .finish()?;
        check(&self.command(frame, Opcode::Listen).await?)?;
        self.state
            .sockets
            .with(handle, |entry| entry.state = SocketState::Listening)
    }
    /// Connect to a remote address.
    ///
    /// This is bounded by [Config::connect_timeout]. The socket stays usable for [Cc3000::close]
    /// after a failed attempt.
    pub async fn connect(&self, handle: SocketHandle, addr: SocketAddrV4) -> Result<()> {
        let _operation = self.state.sockets.begin(handle)?;
        debug!("Connecting to {:?}:{}.", addr.ip().octets(), addr.port());
        self.address_command(handle, Opcode::Connect, addr, self.config.connect_timeout)
            .await?;
        self.state
            .sockets
            .with(handle, |entry| entry.state = SocketState::Connected)
    }
    /// Wait for an incoming connection on a listening socket.
    ///
    /// If the chip has no connection ready, the call blocks until the chip reports one, or
    /// [Config::accept_timeout] elapses.
    pub async fn accept(&self, handle: SocketHandle) -> Result<(SocketHandle, SocketAddrV4)> {
        let _operation = self.state.sockets.begin(handle)?;
        let (hw, socket_type) = self.state.sockets.with(handle, |entry| {
            entry.accepted = None;
            match entry.state {
                SocketState::Listening => Ok((entry.hw, entry.socket_type)),
                SocketState::Closed => Err(Error::ConnectionClosed),
                _ => Err(Error::InvalidArgument),
            }
        })??;
        let frame = FrameBuilder::command(Opcode::Accept).i32(hw).finish()?;
        let reply = self.command(frame, Opcode::Accept).await?;
        if reply.status != 0 {
            return Err(Error::Io(-(reply.status as i32)));
        }
        let mut args = reply.reader();
        let _listener = args.i32()?;
        let (accepted, addr) = match (args.i32()?, args.sockaddr()?) {
            (SOC_IN_PROGRESS, _) => self.wait_for_connection(handle).await?,
            (accepted, addr) if accepted >= 0 => (accepted, addr),
            (error, _) => return Err(Error::Io(error)),
        };
        debug!(
            "Accepted socket {} from {:?}:{}.",
            accepted,
            addr.ip().octets(),
            addr.port()
        );
        match self.state.sockets.reserve(socket_type) {
            Ok(reservation) => Ok((reservation.commit(accepted, SocketState::Connected), addr)),
            Err(error) => {
                // We have no slot to track it, so the connection can't be used.
                let frame = FrameBuilder::command(Opcode::CloseSocket)
                    .i32(accepted)
                    .finish()?;
                let _ = self.command(frame, Opcode::CloseSocket).await;
                Err(error)
            }
        }
    }
    /// Wait for the runner to route the connection event to the listening socket.
    async fn wait_for_connection(&self, handle: SocketHandle) -> Result<(i32, SocketAddrV4)> {
        let connection = self.state.sockets.wait(handle, |entry| match entry {
            None => Some(Err(Error::ConnectionClosed)),
            Some(entry) => match entry.accepted.take() {
                Some(accepted) => Some(Ok(accepted)),
                None if entry.is_closed() => Some(Err(Error::ConnectionClosed)),
                None => None,
            },
        });
        let result = match self.config.accept_timeout {
            Some(timeout) => with_timeout(timeout, connection)
                .await
                .unwrap_or(Err(Error::Timeout)),
            None => connection.await,
        };
        if result.is_err() {
            let _ = self
                .state
                .sockets
                .with(handle, |entry| entry.accept_waiting = false);
        }
        result
    }

    /// Transmit one data frame and wait for the chip to report how much it took.
    async fn send_frame(
        &self,
        handle: SocketHandle,
        data: &[u8],
        flags: u32,
        to: Option<SocketAddrV4>,
    ) -> Result<usize> {
        let hw = self.open_socket(handle)?;
        // Every data frame occupies one buffer on the chip until it's freed again.
        if let Either::Second(()) = select(self.state.credits.acquire(), self.closed(handle)).await
        {
            return Err(Error::ConnectionClosed);
        }
        let (builder, expected) = match to {
            Some(addr) => (
                FrameBuilder::data(DataOpcode::SendTo)
                    .i32(hw)
                    .u32(24)
                    .u32(data.len() as u32)
                    .u32(flags)
                    .u32(SOCKADDR_SIZE as u32)
                    .sockaddr(addr),
                Opcode::SendTo,
            ),
            None => (
                FrameBuilder::data(DataOpcode::Send)
                    .i32(hw)
                    .u32(16)
                    .u32(data.len() as u32)
                    .u32(flags),
                Opcode::Send,
            ),
        };
        let frame = builder.payload(data).finish()?;
        trace!(
            "Sending {} bytes on socket {}, {} buffers left.",
            data.len(),
            hw,
            self.state.credits.available()
        );
        // Once handed to the runner, the frame is written even if we stop waiting for the reply.
        // The buffer then comes back through a free buffer event.
        let reply = self
            .commands()
            .await
            .execute_on(frame, expected, hw, self.config.command_timeout)
            .await?;
        let mut args = reply.reader();
        let _hw = args.i32()?;
        match args.i32()? {
            sent if sent >= 0 => Ok(sent as usize),
            _ if self.open_socket(handle).is_err() => Err(Error::ConnectionClosed),
            error => Err(Error::Io(error)),
        }
    }
    /// Send data on a connected socket.
    ///
    /// At most [Config::max_send_chunk] bytes are transmitted, so this may return a short count.
    pub async fn send(&self, handle: SocketHandle, data: &[u8], flags: u32) -> Result<usize> {
        let _operation = self.state.sockets.begin(handle)?;
        if data.is_empty() {
            return Ok(0);
        }
        let chunk = data.len().min(self.config.max_send_chunk);
        self.send_frame(handle, &data[..chunk], flags, None).await
    }
    /// Send all of `data`, looping until the chip took every byte.
    pub async fn send_all(&self, handle: SocketHandle, data: &[u8], flags: u32) -> Result<()> {
        let _operation = self.state.sockets.begin(handle)?;
        let mut sent = 0;
        while sent < data.len() {
            let chunk = (data.len() - sent).min(self.config.max_send_chunk);
            match self
                .send_frame(handle, &data[sent..sent + chunk], flags, None)
                .await?
            {
                0 => {
                    warn!("Chip made no progress after {} bytes.", sent);
                    return Err(Error::Io(0));
                }
                written => sent += written.min(chunk),
            }
        }
        Ok(())
    }
    /// Send a datagram.
    pub async fn send_to(
        &self,
        handle: SocketHandle,
        data: &[u8],
        addr: SocketAddrV4,
        flags: u32,
    ) -> Result<usize> {
        let _operation = self.state.sockets.begin(handle)?;
        if data.len() > self.config.max_send_chunk {
            return Err(Error::InvalidArgument);
        }
        self.send_frame(handle, data, flags, Some(addr)).await
    }

    /// Receive into `buffer`, asking the chip for data whenever nothing is queued.
    async fn receive(
        &self,
        handle: SocketHandle,
        buffer: &mut [u8],
        flags: u32,
        opcode: Opcode,
    ) -> Result<usize> {
        let _operation = self.state.sockets.begin(handle)?;
        if buffer.is_empty() {
            return Ok(0);
        }
        let timeout = self
            .state
            .sockets
            .with(handle, |entry| entry.recv_timeout)?
            .unwrap_or(self.config.recv_timeout);
        with_timeout(
            timeout,
            self.receive_until_data(handle, buffer, flags, opcode),
        )
        .await
        .unwrap_or(Err(Error::Timeout))
    }
    /// Ask the chip, whether a receive on the socket would complete right away.
    ///
    /// The chip blocks for a few milliseconds at most, so the command lock is only held briefly.
    async fn readable(&self, hw: i32) -> Result<bool> {
        let set = u32::try_from(hw)
            .ok()
            .and_then(|hw| 1u32.checked_shl(hw))
            .ok_or(Error::Protocol)?;
        let frame = FrameBuilder::command(Opcode::Select)
            .i32(hw + 1)
            .u32(SELECT_SETS_OFFSET)
            .u32(SELECT_SETS_OFFSET)
            .u32(SELECT_SETS_OFFSET)
            .u32(SELECT_SETS_OFFSET)
            // Not blocking, since a timeout follows.
            .u32(0)
            .u32(set)
            .u32(0)
            .u32(0)
            .u32(0)
            .u32(SELECT_MIN_TIMEOUT)
            .finish()?;
        let reply = self.command(frame, Opcode::Select).await?;
        let mut args = reply.reader();
        match args.i32()? {
            error if error < 0 => Err(Error::Io(error)),
            0 => Ok(false),
            _ => Ok(args.u32()? & set != 0),
        }
    }
    async fn receive_until_data(
        &self,
        handle: SocketHandle,
        buffer: &mut [u8],
        flags: u32,
        opcode: Opcode,
    ) -> Result<usize> {
        loop {
            if let Some(read) = self.state.sockets.drain(handle, buffer)? {
                return Ok(read);
            }
            let (hw, space) = self.state.sockets.with(handle, |entry| {
                (entry.hw, entry.rx.capacity() - entry.rx.len())
            })?;
            // A receive on the chip blocks until data arrives, which would stall every other
            // command. So it's only issued once select reported the socket readable.
            if !self.readable(hw).await? {
                select(
                    Timer::after(self.config.recv_poll_interval),
                    self.closed(handle),
                )
                .await;
                continue;
            }
            let frame = FrameBuilder::command(opcode)
                .i32(hw)
                .u32(buffer.len().min(space) as u32)
                .u32(flags)
                .finish()?;
            let reply = self
                .commands()
                .await
                .execute_on(frame, opcode, hw, self.config.command_timeout)
                .await?;
            let mut args = reply.reader();
            let _hw = args.i32()?;
            match args.i32()? {
                0 => {
                    trace!("Socket {} reached the end of the stream.", hw);
                    self.state.sockets.peer_closed(hw);
                }
                error if error < 0 => return Err(Error::Io(error)),
                // The data follows as a separate frame.
                _ => {
                    self.state
                        .sockets
                        .wait(handle, |entry| match entry {
                            Some(entry) if entry.rx.is_empty() && !entry.is_closed() => None,
                            _ => Some(()),
                        })
                        .await
                }
            }
        }
    }
    /// Receive from a connected socket.
    ///
    /// Blocks until data is available, the socket was closed, or the receive timeout elapsed.
    pub async fn recv_into(
        &self,
        handle: SocketHandle,
        buffer: &mut [u8],
        flags: u32,
    ) -> Result<usize> {
        self.receive(handle, buffer, flags, Opcode::Recv).await
    }
    /// Receive a datagram, together with its source address.
    pub async fn recvfrom_into(
        &self,
        handle: SocketHandle,
        buffer: &mut [u8],
        flags: u32,
    ) -> Result<(usize, SocketAddrV4)> {
        let read = self
            .receive(handle, buffer, flags, Opcode::RecvFrom)
            .await?;
        let from = self
            .state
            .sockets
            .with(handle, |entry| entry.from)?
            .unwrap_or(SocketAddrV4::new(core::net::Ipv4Addr::UNSPECIFIED, 0));
        Ok((read, from))
    }
}
