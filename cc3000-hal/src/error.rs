/// Errors reported by the driver.
///
/// [Error::Protocol] is fatal: once it has been observed, every socket is invalidated, the link is
/// considered down and the chip has to be brought up again with
/// [Cc3000::reinit](crate::Cc3000::reinit).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The chip didn't signal readiness within the boot timeout.
    HardwareInit,
    /// A reply or event didn't arrive in time.
    Timeout,
    /// The access point rejected the association.
    AuthFailure,
    /// All hardware sockets are in use.
    ResourceExhausted,
    /// The socket was closed, either locally, by the peer or by losing the link.
    ConnectionClosed,
    /// A malformed or out of sequence frame was seen on the bus.
    Protocol,
    /// The requested board layout or socket family isn't supported.
    Unsupported,
    /// The socket handle is stale or was never handed out.
    InvalidHandle,
    /// An argument doesn't fit into an HCI frame or has an invalid value.
    InvalidArgument,
    /// Another blocking operation is already in flight on this socket.
    Busy,
    /// The firmware returned an error code, that isn't covered by any other variant.
    Io(i32),
}

pub type Result<T> = core::result::Result<T, Error>;
