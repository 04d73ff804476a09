//! Byte exchange with the CC3000.
//!
//! The chip uses a half duplex handshake on top of SPI. When it has a frame for the host, it
//! pulls IRQ low and the host clocks the frame out. When the host wants to write, it asserts chip
//! select and waits for the chip to acknowledge by pulling IRQ low, before clocking out the
//! frame. The only exception is the very first write after power up, which is done blindly, with
//! a short pause after the first four bytes.

use embassy_time::{with_timeout, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::{digital::Wait, spi::SpiBus};

use crate::{
    hci::{self, READ_HEADER_SIZE, RX_BUFFER_SIZE, SPI_HEADER_SIZE, SPI_OP_READ},
    Config, Error, Result,
};

/// Chip select held for the duration of one exchange.
///
/// It's released once dropped, so an error in the middle of a transfer can't leave the bus
/// selected.
struct ChipSelect<'a, CS: OutputPin> {
    cs: &'a mut CS,
}
impl<'a, CS: OutputPin> ChipSelect<'a, CS> {
    fn assert(cs: &'a mut CS) -> Result<Self> {
        cs.set_low().map_err(|_| Error::Protocol)?;
        Ok(Self { cs })
    }
}
impl<CS: OutputPin> Drop for ChipSelect<'_, CS> {
    fn drop(&mut self) {
        let _ = self.cs.set_high();
    }
}

pub struct Transport<SPI, CS, WEN, IRQ> {
    spi: SPI,
    cs: CS,
    wen: WEN,
    irq: IRQ,
    /// Set after power up, until the first frame was written.
    first_write: bool,
}
impl<SPI, CS, WEN, IRQ> Transport<SPI, CS, WEN, IRQ>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    WEN: OutputPin,
    IRQ: InputPin + Wait,
{
    pub fn new(spi: SPI, cs: CS, wen: WEN, irq: IRQ) -> Self {
        Self {
            spi,
            cs,
            wen,
            irq,
            first_write: false,
        }
    }
    /// Power cycle the chip and wait for it to signal readiness.
    pub async fn power_up(&mut self, config: &Config) -> Result<()> {
        trace!("Powering up CC3000.");
        self.cs.set_high().map_err(|_| Error::HardwareInit)?;
        self.wen.set_low().map_err(|_| Error::HardwareInit)?;
        Timer::after(config.power_down_settle).await;
        self.wen.set_high().map_err(|_| Error::HardwareInit)?;
        match with_timeout(config.boot_timeout, self.irq.wait_for_low()).await {
            Ok(Ok(())) => {
                self.first_write = true;
                Ok(())
            }
            Ok(Err(_)) => Err(Error::HardwareInit),
            Err(_) => {
                warn!("CC3000 didn't signal readiness within the boot timeout.");
                let _ = self.wen.set_low();
                Err(Error::HardwareInit)
            }
        }
    }
    /// Pull WEN low, which shuts the chip down.
    pub fn power_down(&mut self) {
        trace!("Powering down CC3000.");
        self.first_write = false;
        let _ = self.wen.set_low();
        let _ = self.cs.set_high();
    }
    /// Check if the chip currently asserts IRQ.
    pub fn irq_asserted(&mut self) -> Result<bool> {
        self.irq.is_low().map_err(|_| Error::Protocol)
    }
    /// Wait for the chip to assert IRQ.
    pub async fn wait_irq(&mut self) -> Result<()> {
        self.irq.wait_for_low().await.map_err(|_| Error::Protocol)
    }
    /// Write a complete frame, as produced by [FrameBuilder](crate::hci::FrameBuilder).
    pub async fn write(&mut self, frame: &[u8], config: &Config) -> Result<()> {
        if self.first_write {
            trace!("First write of {} bytes.", frame.len());
            let (head, tail) = frame.split_at(4.min(frame.len()));
            let _cs = ChipSelect::assert(&mut self.cs)?;
            Timer::after(config.first_write_delay).await;
            self.spi.write(head).await.map_err(|_| Error::Protocol)?;
            Timer::after(config.first_write_delay).await;
            self.spi.write(tail).await.map_err(|_| Error::Protocol)?;
            self.spi.flush().await.map_err(|_| Error::Protocol)?;
            self.first_write = false;
            return Ok(());
        }
        let _cs = ChipSelect::assert(&mut self.cs)?;
        // The chip has to acknowledge the request before we may clock out any data. Missing that
        // window desynchronizes the link.
        match with_timeout(config.turnaround_timeout, self.irq.wait_for_low()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Protocol),
            Err(_) => {
                error!("CC3000 didn't acknowledge the write request.");
                return Err(Error::Protocol);
            }
        }
        self.spi.write(frame).await.map_err(|_| Error::Protocol)?;
        self.spi.flush().await.map_err(|_| Error::Protocol)
    }
    /// Read the frame the chip signalled through IRQ.
    ///
    /// Returns the HCI packet, including any padding.
    pub async fn read<'b>(&mut self, buffer: &'b mut [u8; RX_BUFFER_SIZE]) -> Result<&'b [u8]> {
        let _cs = ChipSelect::assert(&mut self.cs)?;
        buffer[..READ_HEADER_SIZE].fill(0);
        buffer[0] = SPI_OP_READ;
        self.spi
            .transfer_in_place(&mut buffer[..READ_HEADER_SIZE])
            .await
            .map_err(|_| Error::Protocol)?;
        let length = hci::spi_read_length(&buffer[..SPI_HEADER_SIZE])?;
        let end = SPI_HEADER_SIZE + length;
        if end < READ_HEADER_SIZE || end > RX_BUFFER_SIZE {
            warn!("Invalid SPI read length {}.", length);
            return Err(Error::Protocol);
        }
        if end > READ_HEADER_SIZE {
            let rest = &mut buffer[READ_HEADER_SIZE..end];
            rest.fill(0);
            self.spi
                .transfer_in_place(rest)
                .await
                .map_err(|_| Error::Protocol)?;
        }
        self.spi.flush().await.map_err(|_| Error::Protocol)?;
        Ok(&buffer[SPI_HEADER_SIZE..end])
    }
}
