//! Book keeping for the sockets of the chip.
//!
//! The chip only has a handful of sockets. We mirror each of them in a slot of the [SocketTable],
//! which the caller refers to through a [SocketHandle]. Since a slot gets reused once the socket
//! is closed, handles carry a generation, which makes handles to closed sockets stale instead of
//! silently aliasing a newer socket.

use core::{cell::RefCell, future::Future, mem, net::SocketAddrV4};

use embassy_sync::blocking_mutex;
use embassy_time::Duration;
use heapless::Deque;
use macro_bits::serializable_enum;

use crate::{sync::Notifier, DefaultRawMutex, Error, Result};

/// The number of sockets the chip supports.
pub const MAX_SOCKETS: usize = 4;
/// Bytes buffered per socket, between the chip handing them over and the caller reading them.
pub const RX_QUEUE_SIZE: usize = 1024;

/// Returned by the chip, if an accept has to wait for a connection.
pub(crate) const SOC_IN_PROGRESS: i32 = -2;

/// The address family of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Family {
    Inet,
    /// Not supported by the chip.
    Inet6,
}
impl Family {
    pub(crate) const AF_INET: u32 = 2;
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// The type of a socket.
    pub enum SocketType: u8 {
        Stream => 1,
        Datagram => 2,
        Raw => 3
    }
}
impl SocketType {
    /// The protocol used, if none is specified.
    pub const fn default_protocol(self) -> u32 {
        match self {
            Self::Stream => 6,
            Self::Datagram => 17,
            _ => 255,
        }
    }
}

/// The life cycle of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    Connected,
    /// Closed by the peer or because the link went away. Only [close](crate::Cc3000::close) is
    /// useful from here.
    Closed,
}

/// Refers to a socket opened through [socket](crate::Cc3000::socket) or
/// [accept](crate::Cc3000::accept).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketHandle {
    slot: u8,
    generation: u16,
}
impl SocketHandle {
    fn slot(&self) -> usize {
        self.slot as usize
    }
}

pub(crate) struct SocketEntry {
    /// The handle used by the chip. Negative, while the socket is still being created.
    pub hw: i32,
    pub socket_type: SocketType,
    pub state: SocketState,
    busy: bool,
    pub rx: Deque<u8, RX_QUEUE_SIZE>,
    /// Where the last datagram came from.
    pub from: Option<SocketAddrV4>,
    pub recv_timeout: Option<Duration>,
    /// Set while an accept waits for the chip to report a connection.
    pub accept_waiting: bool,
    pub accepted: Option<(i32, SocketAddrV4)>,
}
impl SocketEntry {
    const fn new(socket_type: SocketType) -> Self {
        Self {
            hw: -1,
            socket_type,
            state: SocketState::Created,
            busy: false,
            rx: Deque::new(),
            from: None,
            recv_timeout: None,
            accept_waiting: false,
            accepted: None,
        }
    }
    pub fn is_closed(&self) -> bool {
        self.state == SocketState::Closed
    }
}

struct Slot {
    generation: u16,
    entry: Option<SocketEntry>,
}
impl Slot {
    fn get(&mut self, handle: SocketHandle) -> Option<&mut SocketEntry> {
        if self.generation != handle.generation {
            return None;
        }
        self.entry.as_mut()
    }
}

const EMPTY_SLOT: Slot = Slot {
    generation: 0,
    entry: None,
};
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_NOTIFIER: Notifier = Notifier::new();

pub(crate) struct SocketTable {
    slots: blocking_mutex::Mutex<DefaultRawMutex, RefCell<[Slot; MAX_SOCKETS]>>,
    notifiers: [Notifier; MAX_SOCKETS],
}
impl SocketTable {
    pub const fn new() -> Self {
        Self {
            slots: blocking_mutex::Mutex::new(RefCell::new([EMPTY_SLOT; MAX_SOCKETS])),
            notifiers: [EMPTY_NOTIFIER; MAX_SOCKETS],
        }
    }
    fn with_slots<R>(&self, f: impl FnOnce(&mut [Slot; MAX_SOCKETS]) -> R) -> R {
        self.slots.lock(|slots| f(&mut slots.borrow_mut()))
    }
    fn notify_all(&self) {
        self.notifiers.iter().for_each(Notifier::notify);
    }
    /// Claim a free slot for a socket, that's about to be created.
    pub fn reserve(&self, socket_type: SocketType) -> Result<Reservation<'_>> {
        let handle = self.with_slots(|slots| {
            let (index, slot) = slots
                .iter_mut()
                .enumerate()
                .find(|(_, slot)| slot.entry.is_none())?;
            slot.entry = Some(SocketEntry::new(socket_type));
            Some(SocketHandle {
                slot: index as u8,
                generation: slot.generation,
            })
        });
        match handle {
            Some(handle) => Ok(Reservation {
                table: self,
                handle,
                committed: false,
            }),
            None => {
                debug!("All {} sockets are in use.", MAX_SOCKETS);
                Err(Error::ResourceExhausted)
            }
        }
    }
    /// Run `f` on the entry. Fails with [Error::InvalidHandle], if the handle is stale.
    pub fn with<R>(
        &self,
        handle: SocketHandle,
        f: impl FnOnce(&mut SocketEntry) -> R,
    ) -> Result<R> {
        self.with_slots(|slots| {
            slots
                .get_mut(handle.slot())
                .and_then(|slot| slot.get(handle))
                .map(f)
                .ok_or(Error::InvalidHandle)
        })
    }
    /// Free the slot and wake anyone waiting on it.
    ///
    /// Returns the handle of the chip, if the socket still existed.
    pub fn release(&self, handle: SocketHandle) -> Option<i32> {
        let hw = self.with_slots(|slots| {
            let slot = slots.get_mut(handle.slot())?;
            slot.get(handle)?;
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry.take().map(|entry| entry.hw)
        });
        if hw.is_some() {
            self.notifiers[handle.slot()].notify();
        }
        hw
    }
    /// Mark the socket busy for the lifetime of the returned guard.
    ///
    /// Only one blocking operation may be outstanding per socket. A second one fails with
    /// [Error::Busy].
    pub fn begin(&self, handle: SocketHandle) -> Result<Operation<'_>> {
        self.with(handle, |entry| {
            if mem::replace(&mut entry.busy, true) {
                Err(Error::Busy)
            } else {
                Ok(())
            }
        })??;
        Ok(Operation {
            table: self,
            handle,
        })
    }
    /// Wait until `check` yields a value.
    ///
    /// `check` runs every time something about the socket changes. It gets [None], once the socket
    /// was released.
    pub fn wait<'a, T>(
        &'a self,
        handle: SocketHandle,
        mut check: impl FnMut(Option<&mut SocketEntry>) -> Option<T> + 'a,
    ) -> impl Future<Output = T> + 'a {
        let notifier = &self.notifiers[handle.slot()];
        notifier.wait_for(move || {
            self.with_slots(|slots| {
                check(
                    slots
                        .get_mut(handle.slot())
                        .and_then(|slot| slot.get(handle)),
                )
            })
        })
    }
    /// Move buffered bytes into `buffer`.
    ///
    /// Yields [None], if there's nothing buffered yet and the socket is still open.
    pub fn drain(&self, handle: SocketHandle, buffer: &mut [u8]) -> Result<Option<usize>> {
        self.with_slots(|slots| {
            let Some(entry) = slots
                .get_mut(handle.slot())
                .and_then(|slot| slot.get(handle))
            else {
                return Err(Error::ConnectionClosed);
            };
            Self::drain_entry(entry, buffer)
        })
    }
    pub fn drain_entry(entry: &mut SocketEntry, buffer: &mut [u8]) -> Result<Option<usize>> {
        if entry.rx.is_empty() {
            return if entry.is_closed() {
                Err(Error::ConnectionClosed)
            } else {
                Ok(None)
            };
        }
        let mut read = 0;
        for byte in buffer.iter_mut() {
            let Some(next) = entry.rx.pop_front() else {
                break;
            };
            *byte = next;
            read += 1;
        }
        Ok(Some(read))
    }
    fn find_hw(
        slots: &mut [Slot; MAX_SOCKETS],
        hw: i32,
    ) -> Option<(usize, &mut SocketEntry)> {
        if hw < 0 {
            return None;
        }
        slots
            .iter_mut()
            .enumerate()
            .find_map(|(index, slot)| match slot.entry.as_mut() {
                Some(entry) if entry.hw == hw => Some((index, entry)),
                _ => None,
            })
    }
    /// Queue data received by the chip.
    pub fn deliver(&self, hw: i32, data: &[u8], from: Option<SocketAddrV4>) -> bool {
        let index = self.with_slots(|slots| {
            let (index, entry) = Self::find_hw(slots, hw)?;
            let mut dropped = 0;
            for byte in data {
                if entry.rx.push_back(*byte).is_err() {
                    dropped += 1;
                }
            }
            if dropped != 0 {
                warn!("Receive queue of socket {} overflowed by {} bytes.", hw, dropped);
            }
            if from.is_some() {
                entry.from = from;
            }
            Some(index)
        });
        match index {
            Some(index) => {
                self.notifiers[index].notify();
                true
            }
            None => false,
        }
    }
    /// The peer closed the connection. Buffered data can still be read.
    pub fn peer_closed(&self, hw: i32) -> bool {
        let index = self.with_slots(|slots| {
            let (index, entry) = Self::find_hw(slots, hw)?;
            entry.state = SocketState::Closed;
            Some(index)
        });
        if let Some(index) = index {
            self.notifiers[index].notify();
        }
        index.is_some()
    }
    /// The chip will report the next connection on `listener` through an event.
    pub fn expect_connection(&self, listener: i32) {
        self.with_slots(|slots| {
            if let Some((_, entry)) = Self::find_hw(slots, listener) {
                entry.accepted = None;
                entry.accept_waiting = true;
            }
        });
    }
    /// Complete an accept, that's waiting for the chip.
    pub fn accept_ready(&self, listener: i32, accepted: i32, addr: SocketAddrV4) -> bool {
        let index = self.with_slots(|slots| {
            let (index, entry) = Self::find_hw(slots, listener)?;
            if !entry.accept_waiting {
                return None;
            }
            entry.accept_waiting = false;
            entry.accepted = Some((accepted, addr));
            Some(index)
        });
        if let Some(index) = index {
            self.notifiers[index].notify();
        }
        index.is_some()
    }
    /// Mark every socket closed. This happens when the link or the chip goes away.
    pub fn close_all(&self) {
        debug!("Closing all {} sockets.", self.live());
        self.with_slots(|slots| {
            slots
                .iter_mut()
                .filter_map(|slot| slot.entry.as_mut())
                .for_each(|entry| {
                    entry.state = SocketState::Closed;
                    entry.accept_waiting = false;
                })
        });
        self.notify_all();
    }
    /// Forget every socket, making all handles stale. Used when the chip was reset.
    pub fn clear(&self) {
        self.with_slots(|slots| {
            for slot in slots.iter_mut() {
                if slot.entry.take().is_some() {
                    slot.generation = slot.generation.wrapping_add(1);
                }
            }
        });
        self.notify_all();
    }
    /// The number of sockets currently allocated.
    pub fn live(&self) -> usize {
        self.with_slots(|slots| slots.iter().filter(|slot| slot.entry.is_some()).count())
    }
}

/// A slot claimed by [SocketTable::reserve].
///
/// The slot is freed again once dropped, unless it was committed.
pub(crate) struct Reservation<'a> {
    table: &'a SocketTable,
    handle: SocketHandle,
    committed: bool,
}
impl Reservation<'_> {
    /// Record the chip's handle for the socket and hand it to the caller.
    pub fn commit(mut self, hw: i32, state: SocketState) -> SocketHandle {
        let _ = self.table.with(self.handle, |entry| {
            entry.hw = hw;
            entry.state = state;
        });
        self.committed = true;
        self.handle
    }
}
impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.table.release(self.handle);
        }
    }
}

/// Clears the busy flag of a socket once dropped.
pub(crate) struct Operation<'a> {
    table: &'a SocketTable,
    handle: SocketHandle,
}
impl Drop for Operation<'_> {
    fn drop(&mut self) {
        let _ = self.table.with(self.handle, |entry| entry.busy = false);
    }
}
