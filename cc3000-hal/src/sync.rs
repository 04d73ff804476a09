use core::{
    cell::RefCell,
    future::{poll_fn, Future},
    task::Poll,
};

use atomic_waker::AtomicWaker;
use embassy_sync::{blocking_mutex, waitqueue::MultiWakerRegistration};
use portable_atomic::{AtomicI32, AtomicU32, Ordering};

use crate::{hci::Reply, DefaultRawMutex, Error, Result, MAX_SOCKETS};

/// The correlation record for the one command, that may be in flight at any time.
///
/// It's armed with the opcode of the expected reply before the command is handed to the runner
/// and resolved exactly once, either by the matching event or by a fatal error. Replies to socket
/// commands start with the socket descriptor, so those can additionally be bound to a socket.
pub struct PendingReply {
    expected: AtomicU32,
    descriptor: AtomicI32,
    result: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<Result<Reply>>>>,
    waker: AtomicWaker,
}
impl PendingReply {
    const NONE: u32 = u32::MAX;
    const ANY_SOCKET: i32 = i32::MIN;
    pub const fn new() -> Self {
        Self {
            expected: AtomicU32::new(Self::NONE),
            descriptor: AtomicI32::new(Self::ANY_SOCKET),
            result: blocking_mutex::Mutex::new(RefCell::new(None)),
            waker: AtomicWaker::new(),
        }
    }
    /// Expect a reply with the specified opcode.
    ///
    /// With a `descriptor`, only a reply concerning that socket is accepted.
    pub fn arm(&self, opcode: u16, descriptor: Option<i32>) {
        self.result.lock(|result| *result.borrow_mut() = None);
        self.descriptor
            .store(descriptor.unwrap_or(Self::ANY_SOCKET), Ordering::Relaxed);
        self.expected.store(opcode as u32, Ordering::Release);
    }
    /// Stop waiting for a reply. A reply arriving afterwards is treated as unsolicited.
    pub fn disarm(&self) {
        self.expected.store(Self::NONE, Ordering::Release);
    }
    /// The opcode we're currently waiting for.
    pub fn expected(&self) -> Option<u16> {
        match self.expected.load(Ordering::Acquire) {
            Self::NONE => None,
            opcode => Some(opcode as u16),
        }
    }
    /// Check whether the event with `opcode` and `args` is the reply we're waiting for.
    pub fn matches(&self, opcode: u16, args: &[u8]) -> bool {
        if self.expected() != Some(opcode) {
            return false;
        }
        match self.descriptor.load(Ordering::Relaxed) {
            Self::ANY_SOCKET => true,
            descriptor => args
                .get(..4)
                .is_some_and(|sd| sd == descriptor.to_le_bytes().as_slice()),
        }
    }
    /// Hand the reply to the waiting caller.
    ///
    /// Returns the reply back, if nobody is waiting for it.
    pub fn resolve(&self, reply: Reply) -> core::result::Result<(), Reply> {
        if !self.matches(reply.opcode, &reply.args) {
            return Err(reply);
        }
        self.complete(Ok(reply));
        Ok(())
    }
    /// Fail the outstanding command, if there is one.
    pub fn fail(&self, error: Error) {
        if self.expected().is_some() {
            self.complete(Err(error));
        }
    }
    fn complete(&self, result: Result<Reply>) {
        self.expected.store(Self::NONE, Ordering::Release);
        self.result
            .lock(|slot| *slot.borrow_mut() = Some(result));
        self.waker.wake();
    }
    /// Take the result without waiting.
    pub fn take(&self) -> Option<Result<Reply>> {
        self.result.lock(|slot| slot.borrow_mut().take())
    }
    /// Wait for the reply to arrive.
    pub fn wait(&self) -> impl Future<Output = Result<Reply>> + '_ {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.result.lock(|slot| slot.borrow_mut().take()) {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            }
        })
    }
}

struct CreditPool {
    credits: usize,
    waiters: MultiWakerRegistration<MAX_SOCKETS>,
}

/// Tracks the number of transmit buffers, that are free on the chip.
///
/// Every data frame occupies one buffer until the chip returns it through a free buffer event.
/// Every socket may have a send waiting here, so all of them are woken once buffers come back.
pub struct BufferCredits {
    pool: blocking_mutex::Mutex<DefaultRawMutex, RefCell<CreditPool>>,
}
impl BufferCredits {
    pub const fn new() -> Self {
        Self {
            pool: blocking_mutex::Mutex::new(RefCell::new(CreditPool {
                credits: 0,
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }
    fn with_pool<R>(&self, f: impl FnOnce(&mut CreditPool) -> R) -> R {
        self.pool.lock(|pool| f(&mut pool.borrow_mut()))
    }
    /// Set the number of free buffers, as reported by the chip during bring-up.
    pub fn reset(&self, credits: usize) {
        self.with_pool(|pool| {
            pool.credits = credits;
            pool.waiters.wake();
        })
    }
    /// Return buffers freed by the chip.
    pub fn release(&self, credits: usize) {
        self.with_pool(|pool| {
            pool.credits += credits;
            pool.waiters.wake();
        })
    }
    pub fn available(&self) -> usize {
        self.with_pool(|pool| pool.credits)
    }
    /// Asynchronously wait for a buffer and take it.
    pub async fn acquire(&self) {
        poll_fn(|cx| {
            self.with_pool(|pool| match pool.credits.checked_sub(1) {
                Some(left) => {
                    pool.credits = left;
                    Poll::Ready(())
                }
                None => {
                    pool.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }
}

/// Wakes a single task, that waits for some shared state to change.
pub struct Notifier {
    waker: AtomicWaker,
}
impl Notifier {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
        }
    }
    pub fn notify(&self) {
        self.waker.wake();
    }
    /// Wait until `check` yields a value.
    ///
    /// The waker is registered before `check` runs, so a notification between the two can't
    /// get lost.
    pub fn wait_for<'a, T>(
        &'a self,
        mut check: impl FnMut() -> Option<T> + 'a,
    ) -> impl Future<Output = T> + 'a {
        poll_fn(move |cx| {
            self.waker.register(cx.waker());
            match check() {
                Some(value) => Poll::Ready(value),
                None => Poll::Pending,
            }
        })
    }
}
