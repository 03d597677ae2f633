//! Block protocol engine for the serial link between a fuzzing controller
//! and a smartcard bridge.
//!
//! The link carries *blocks* over a full duplex, interrupt driven serial
//! channel.  Each block is a control byte, an optional three byte big endian
//! length followed by that many payload bytes (data blocks only), and a one
//! byte check field:
//!
//! ```text
//! [tag] [len1 len2 len3 payload...]? [check]
//! ```
//!
//! Data and reset blocks must be answered by the peer with a dedicated ACK
//! block before the originating cycle is considered complete.  Because the
//! channel is full duplex, that ACK can arrive in the middle of an unrelated
//! reception, and an outgoing ACK may have to wait until the transmitter is
//! done with the block it is currently pushing out.
//!
//! The engine is split into two byte-at-a-time state machines, one per
//! direction, sharing a [`Link`] context.  Both are designed to be driven
//! from interrupt handlers: [`Link::on_byte_received`] consumes one received
//! byte, [`Link::next_byte_to_send`] produces the next byte to put on the
//! wire.  Neither ever blocks; contention is reported as [`Error::Busy`].
//! The machines talk to each other only through a small set of flags in the
//! shared context, which is how the ACK interleaving above stays correct in
//! either completion order.
//!
//! The check byte is carried on the wire but its value is a placeholder:
//! always emitted as zero and never verified on reception.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod buffer;
pub mod sem;

mod rx;
mod tx;

#[cfg(test)]
mod testlog;

pub use buffer::ByteBuffer;
pub use sem::Semaphore;

use rx::Reception;
use tx::Transmission;

cfg_if::cfg_if! {
    if #[cfg(feature = "defmt")] {
        mod log {
            pub use defmt::warn;
        }
    } else if #[cfg(feature = "log")] {
        mod log {
            pub use ::log::warn;
        }
    } else {
        mod log {
            macro_rules! warn {
                ($($arg:tt)*) => {
                    { let _ = ($($arg)*,); }
                };
            }
            pub(crate) use warn;
        }
    }
}

/// Errors surfaced by the engines and the byte buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A lock is already held.  Recoverable: retry, or let the other
    /// engine's completion path resolve it.
    Busy,
    /// A byte event arrived while no cycle was in progress.
    Idle,
    /// A different tag arrived where an ACK control byte was required.
    BadAck,
    /// The requested block kind cannot be transmitted.
    BadBlockType,
    /// The buffer is full.
    Full,
    /// The buffer is empty.
    Empty,
    /// State machine invariant violation.  Fatal to the current cycle; the
    /// link must be reset.
    State,
}

pub type Result<T> = core::result::Result<T, Error>;

/// The kind of a block, as identified by its wire control byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockKind {
    /// Payload carrying block.
    Data,
    /// Any tag this engine does not recognize.
    Unknown,
    /// Cold reset request for the card.
    ColdReset,
    /// Warm reset request for the card.
    WarmReset,
    /// The peer is busy and dropped our block.
    Busy,
    /// Acknowledgment of a previously received block.
    Ack,
    /// Negative acknowledgment.
    Nack,
}

impl BlockKind {
    /// Decode a wire control byte.  Unrecognized values map to `Unknown`.
    pub fn from_wire(byte: u8) -> BlockKind {
        match byte {
            0x00 => BlockKind::Data,
            0x02 => BlockKind::ColdReset,
            0x03 => BlockKind::WarmReset,
            0x04 => BlockKind::Busy,
            0x05 => BlockKind::Ack,
            0x06 => BlockKind::Nack,
            _ => BlockKind::Unknown,
        }
    }

    /// The wire control byte for this kind.
    pub fn to_wire(self) -> u8 {
        match self {
            BlockKind::Data => 0x00,
            BlockKind::Unknown => 0x01,
            BlockKind::ColdReset => 0x02,
            BlockKind::WarmReset => 0x03,
            BlockKind::Busy => 0x04,
            BlockKind::Ack => 0x05,
            BlockKind::Nack => 0x06,
        }
    }

    /// Whether a block of this kind must be answered with a dedicated ACK
    /// block from the peer.
    pub fn needs_ack(self) -> bool {
        matches!(
            self,
            BlockKind::Data | BlockKind::ColdReset | BlockKind::WarmReset
        )
    }
}

/// Callbacks out of the engine, supplied at construction.
///
/// The interrupt gating methods are invoked at cycle boundaries and are
/// expected to reach into the byte channel driver.  The completion methods
/// fire from inside the byte handlers, so implementations should do the
/// minimum and leave real work to the foreground loop.  Every method
/// defaults to a no-op; `()` is the null implementation.
pub trait LinkHooks {
    /// Allow receive-ready events to be delivered.
    fn enable_rx_ready(&mut self) {}
    /// Stop receive-ready events.
    fn disable_rx_ready(&mut self) {}
    /// Allow transmit-ready events to be delivered.
    fn enable_tx_ready(&mut self) {}
    /// Stop transmit-ready events.
    fn disable_tx_ready(&mut self) {}

    /// A block reception cycle completed, whatever the kind.
    fn block_received(&mut self, _kind: BlockKind) {}
    /// A control (non data, non ACK) block was received.
    fn ctrl_block_received(&mut self) {}
    /// A data block was received; the payload sits in the reception buffer.
    fn data_block_received(&mut self) {}
    /// A cold reset request was received.
    fn cold_reset_received(&mut self) {}
    /// A warm reset request was received.
    fn warm_reset_received(&mut self) {}
    /// A block with an unrecognized tag was received.
    fn unknown_block_received(&mut self) {}
    /// The peer acknowledged the block we transmitted.
    fn ack_acknowledged(&mut self) {}
    /// A block transmission cycle completed.
    fn block_sent(&mut self, _kind: BlockKind) {}
}

impl LinkHooks for () {}

/// The communication context: one reception engine, one transmission
/// engine, and the injected [`LinkHooks`].
///
/// One `Link` value serves one bridge session.  It is owned by the
/// orchestration layer and passed by `&mut` into every operation; payload
/// buffers are borrowed for `'b`, so the engine stores the borrow rather
/// than copying the bytes.
pub struct Link<'b, H: LinkHooks, const N: usize> {
    pub(crate) rx: Reception<'b, N>,
    pub(crate) tx: Transmission<'b, N>,
    pub(crate) hooks: H,
}

impl<'b, H: LinkHooks, const N: usize> Link<'b, H, N> {
    /// Build a link around the given hooks.  Both engines start idle with
    /// their interrupt sources disabled.
    pub fn new(hooks: H) -> Self {
        let mut link = Link {
            rx: Reception::new(),
            tx: Transmission::new(),
            hooks,
        };
        link.reset();
        link
    }

    /// Re-initialize both engines: locks freed, flags cleared, buffers
    /// dropped, interrupt sources disabled.  This is also the recovery path
    /// after a fatal protocol error.
    pub fn reset(&mut self) {
        self.hooks.disable_rx_ready();
        self.rx = Reception::new();
        self.hooks.disable_tx_ready();
        self.tx = Transmission::new();
    }

    /// Whether received payload bytes are ready to be dequeued.
    pub fn is_payload_available(&self) -> bool {
        self.rx.in_progress
            && self.rx.kind == BlockKind::Data
            && self.rx.buffer.as_ref().map_or(false, |buf| !buf.is_empty())
    }

    /// Whether every payload byte announced by the length field has been
    /// received.
    pub fn is_fully_received(&self) -> bool {
        self.rx.bytes_received == self.rx.bytes_expected
    }

    /// The reception payload buffer, if one is bound.
    pub fn rx_buffer_mut(&mut self) -> Option<&mut ByteBuffer<N>> {
        self.rx.buffer.as_deref_mut()
    }

    /// The transmission payload buffer, if one is bound.
    pub fn tx_buffer_mut(&mut self) -> Option<&mut ByteBuffer<N>> {
        self.tx.buffer.as_deref_mut()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }
}
