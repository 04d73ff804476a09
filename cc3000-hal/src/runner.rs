//! The event pump.
//!
//! The [Runner] is the only thing touching the bus. It waits for the chip to raise IRQ, reads the
//! frame and routes it to whoever is waiting for it, or writes frames handed over by
//! [Cc3000](crate::Cc3000) handles. Frames are handled strictly in the order the chip sends them.

use embassy_futures::select::{select, Either};
use embassy_time::with_timeout;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::{digital::Wait, spi::SpiBus};

use crate::{
    control::LinkState,
    driver::State,
    hci::{
        self, ArgReader, DataOpcode, Frame, FrameBuilder, Opcode, Reply, TxFrame, RX_BUFFER_SIZE,
    },
    socket::SOC_IN_PROGRESS,
    transport::Transport,
    Config, Error, Result,
};

/// Something for the runner to do on behalf of a [Cc3000](crate::Cc3000).
pub(crate) enum Request {
    /// Write a frame. The reply is routed through the pending reply.
    Frame(TxFrame),
    /// Run the bring-up sequence again.
    Reset,
    /// Power the chip down.
    Shutdown,
}

/// Drives the CC3000.
///
/// [Runner::run] has to be polled continuously, usually from a task of its own, for any
/// operation on [Cc3000](crate::Cc3000) to complete.
pub struct Runner<'a, SPI, CS, WEN, IRQ> {
    state: &'a State,
    transport: Transport<SPI, CS, WEN, IRQ>,
    config: Config,
    rx_buffer: [u8; RX_BUFFER_SIZE],
    powered: bool,
}
impl<'a, SPI, CS, WEN, IRQ> Runner<'a, SPI, CS, WEN, IRQ>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    WEN: OutputPin,
    IRQ: InputPin + Wait,
{
    pub(crate) fn new(
        state: &'a State,
        transport: Transport<SPI, CS, WEN, IRQ>,
        config: Config,
    ) -> Self {
        Self {
            state,
            transport,
            config,
            rx_buffer: [0; RX_BUFFER_SIZE],
            powered: false,
        }
    }
    /// Power up the chip and run the start up handshake.
    pub(crate) async fn bring_up(&mut self) -> Result<()> {
        self.state.reset();
        self.powered = false;
        self.transport.power_up(&self.config).await?;
        self.powered = true;

        let result = async {
            let frame = FrameBuilder::command(Opcode::SimpleLinkStart).u8(0).finish()?;
            self.execute(frame, Opcode::SimpleLinkStart).await?;

            let frame = FrameBuilder::command(Opcode::ReadBufferSize).finish()?;
            let reply = self.execute(frame, Opcode::ReadBufferSize).await?;
            let mut args = reply.reader();
            let buffers = args.u8()?;
            let buffer_length = args.u16()?;
            self.state.credits.reset(buffers as usize);

            let frame = FrameBuilder::command(Opcode::WlanSetConnectionPolicy)
                .u32(0)
                .u32(0)
                .u32(0)
                .finish()?;
            self.execute(frame, Opcode::WlanSetConnectionPolicy).await?;
            info!(
                "CC3000 is up with {} buffers of {} bytes.",
                buffers, buffer_length
            );
            Ok::<_, Error>(())
        }
        .await;
        if let Err(error) = result {
            error!("CC3000 bring-up failed: {:?}", error);
            self.power_down();
            return Err(match error {
                Error::Timeout | Error::Protocol => Error::HardwareInit,
                error => error,
            });
        }
        Ok(())
    }
    fn power_down(&mut self) {
        self.transport.power_down();
        self.powered = false;
        self.state.invalidate(Error::ConnectionClosed);
    }
    /// Issue a command from within the runner and process frames until the reply arrives.
    async fn execute(&mut self, frame: TxFrame, expected: Opcode) -> Result<Reply> {
        self.state.reply.arm(expected.into_bits(), None);
        let timeout = self.config.command_timeout;
        let result = with_timeout(timeout, async {
            self.transport.write(&frame, &self.config).await?;
            loop {
                self.transport.wait_irq().await?;
                self.receive().await?;
                if let Some(result) = self.state.reply.take() {
                    return result;
                }
            }
        })
        .await;
        self.state.reply.disarm();
        result.unwrap_or(Err(Error::Timeout))
    }
    /// Read one frame and dispatch it.
    async fn receive(&mut self) -> Result<()> {
        let packet = self.transport.read(&mut self.rx_buffer).await?;
        dispatch(self.state, hci::decode_frame(packet)?)
    }
    /// The link to the chip is corrupted and has to be reinitialized.
    fn fail(&mut self, error: Error) {
        error!("Fatal protocol error: {:?}. The chip has to be reinitialized.", error);
        self.state.invalidate(Error::Protocol);
    }
    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Frame(frame) => {
                if self.state.is_fatal() || !self.powered {
                    self.state.reply.fail(Error::Protocol);
                    return;
                }
                if let Err(error) = self.write(&frame).await {
                    self.fail(error);
                }
            }
            Request::Reset => {
                let result = self.bring_up().await;
                self.state.lifecycle.signal(result);
            }
            Request::Shutdown => {
                self.power_down();
                self.state.lifecycle.signal(Ok(()));
            }
        }
    }
    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        // Anything the chip already has for us goes first, since it can't take our frame while it
        // waits to hand over its own.
        while self.transport.irq_asserted()? {
            self.receive().await?;
        }
        self.transport.write(frame, &self.config).await
    }
    /// Run the event pump.
    pub async fn run(mut self) -> ! {
        loop {
            if self.state.is_fatal() || !self.powered {
                // Until the chip was reinitialized, IRQ is meaningless.
                let request = self.state.requests.receive().await;
                self.handle_request(request).await;
                continue;
            }
            match select(self.transport.wait_irq(), self.state.requests.receive()).await {
                Either::First(Ok(())) => {
                    if let Err(error) = self.receive().await {
                        self.fail(error);
                    }
                }
                Either::First(Err(error)) => self.fail(error),
                Either::Second(request) => self.handle_request(request).await,
            }
        }
    }
}

/// Route a frame to whoever waits for it.
fn dispatch(state: &State, frame: Frame<'_>) -> Result<()> {
    match frame {
        Frame::Event {
            opcode,
            status,
            args,
        } => dispatch_event(state, opcode, status, args),
        Frame::Data {
            opcode,
            args,
            payload,
        } => {
            let mut reader = ArgReader::new(args);
            let hw = reader.i32()?;
            let from = match DataOpcode::from_bits(opcode) {
                DataOpcode::Recv => None,
                DataOpcode::RecvFrom => {
                    let _length = reader.i32()?;
                    let _flags = reader.u32()?;
                    Some(reader.sockaddr()?)
                }
                _ => {
                    warn!("Dropping data frame with opcode {:#x}.", opcode);
                    return Ok(());
                }
            };
            trace!("Received {} bytes for socket {}.", payload.len(), hw);
            if !state.sockets.deliver(hw, payload, from) {
                warn!("Dropping data for unknown socket {}.", hw);
            }
            Ok(())
        }
    }
}

fn dispatch_event(state: &State, opcode: u16, status: u8, args: &[u8]) -> Result<()> {
    let mut reader = ArgReader::new(args);
    match Opcode::from_bits(opcode) {
        Opcode::WlanUnsolConnect => state.link.link_up(),
        Opcode::WlanUnsolDisconnect => {
            if state.link.go_down() != LinkState::Down {
                info!("Lost the link.");
                if state
                    .reply
                    .expected()
                    .is_some_and(|expected| Opcode::from_bits(expected).is_socket_operation())
                {
                    state.reply.fail(Error::ConnectionClosed);
                }
                state.sockets.close_all();
            }
        }
        Opcode::WlanUnsolDhcp => {
            let ip = reader.ip()?;
            let _mask = reader.ip()?;
            let _gateway = reader.ip()?;
            let _dhcp_server = reader.ip()?;
            let _dns = reader.ip()?;
            match reader.u8()? {
                0 => state.link.dhcp_complete(ip),
                status => warn!("DHCP failed with status {}.", status),
            }
        }
        Opcode::DataUnsolFreeBuff => {
            let count = reader.u16()?;
            let mut freed = 0;
            for _ in 0..count {
                let _hw = reader.u16()?;
                freed += reader.u16()? as usize;
            }
            trace!("Chip freed {} buffers.", freed);
            state.credits.release(freed);
        }
        Opcode::BsdTcpCloseWait => {
            let hw = reader.i32()?;
            debug!("Peer closed socket {}.", hw);
            state.sockets.peer_closed(hw);
        }
        Opcode::WlanKeepalive
        | Opcode::WlanUnsolInit
        | Opcode::WlanTxComplete
        | Opcode::CanShutDown => trace!("Consumed event {:#x}.", opcode),
        Opcode::Accept if route_accept(state, status, args)? => {}
        _ => {
            if !state.reply.matches(opcode, args) {
                route_late_reply(state, opcode, args);
                return Ok(());
            }
            if opcode == Opcode::Accept.into_bits() {
                note_accept_in_progress(state, status, args)?;
            }
            trace!("Reply to command {:#x}.", opcode);
            let _ = state.reply.resolve(Reply::new(opcode, status, args)?);
        }
    }
    Ok(())
}

/// Handle a reply, that nobody waits for anymore. The end of a stream still concerns its socket,
/// even if the receive that found it was given up on.
fn route_late_reply(state: &State, opcode: u16, args: &[u8]) {
    let mut reader = ArgReader::new(args);
    match (Opcode::from_bits(opcode), reader.i32(), reader.i32()) {
        (Opcode::Recv | Opcode::RecvFrom, Ok(hw), Ok(0)) => {
            debug!("Late receive reply closes socket {}.", hw);
            state.sockets.peer_closed(hw);
        }
        _ => warn!("Dropping unmatched event {:#x}.", opcode),
    }
}

/// Hand a connection to a listening socket, that already got its reply and waits for it.
fn route_accept(state: &State, status: u8, args: &[u8]) -> Result<bool> {
    let mut reader = ArgReader::new(args);
    if status != 0 {
        return Ok(false);
    }
    let listener = reader.i32()?;
    let accepted = reader.i32()?;
    let addr = reader.sockaddr()?;
    if accepted < 0 {
        return Ok(false);
    }
    Ok(state.sockets.accept_ready(listener, accepted, addr))
}

/// If the chip has no connection ready yet, mark the listener as waiting, before the reply is
/// handed over. That way the connection can't overtake it.
fn note_accept_in_progress(state: &State, status: u8, args: &[u8]) -> Result<()> {
    let mut reader = ArgReader::new(args);
    let listener = reader.i32()?;
    if status == 0 && reader.i32()? == SOC_IN_PROGRESS {
        state.sockets.expect_connection(listener);
    }
    Ok(())
}
