//! Block reception engine.
//!
//! One cycle assembles exactly one block, one byte per call, from the
//! receive interrupt.  The interesting part is the tail of the cycle: a
//! data or reset block is only complete once our reply ACK went out, and
//! the reply ACK for a block *we* transmitted may arrive in the middle of
//! the cycle this engine is currently running.  Both cases are resolved
//! through the cross flags shared with the transmission engine, never by
//! reading its state.

use crate::buffer::ByteBuffer;
use crate::log::warn;
use crate::sem::Semaphore;
use crate::{BlockKind, Error, Link, LinkHooks, Result};

/// Reception engine states.
///
/// `Check` doubles as the block completion decision point; the `Ack*`
/// states are entered only when the reply ACK to an earlier transmission
/// arrives inside this cycle, and `TransmittedAck` only when the
/// transmission engine reports that the reply ACK this cycle owed has been
/// pushed out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RxState {
    Init,
    CtrlByte,
    LenByte1,
    LenByte2,
    LenByte3,
    Data,
    Check,
    TransmittedAck,
    AckCtrlByte,
    AckCheck,
}

/// Everything one reception cycle needs, plus the flags the transmission
/// engine signals through.
pub(crate) struct Reception<'b, const N: usize> {
    pub(crate) state: RxState,
    /// Destination for payload bytes.  Absent when the payload is
    /// discarded, e.g. while awaiting a bare ACK.
    pub(crate) buffer: Option<&'b mut ByteBuffer<N>>,
    pub(crate) bytes_expected: u32,
    pub(crate) bytes_received: u32,
    pub(crate) kind: BlockKind,
    /// Guards one compute/transition/apply sequence against nested
    /// interrupt delivery.
    pub(crate) context_lock: Semaphore,
    /// Serializes block level reception cycles.
    pub(crate) process_lock: Semaphore,
    /// The peer owes us an ACK for a block the transmission engine sent.
    pub(crate) ack_expected: bool,
    /// Set by the transmission engine once the reply ACK this cycle owed
    /// has been fully transmitted.
    pub(crate) ack_transmitted: bool,
    pub(crate) in_progress: bool,
    /// An ACK block reception occurred somewhere in this cycle.
    pub(crate) ack_seen: bool,
}

impl<'b, const N: usize> Reception<'b, N> {
    pub(crate) fn new() -> Self {
        Reception {
            state: RxState::Init,
            buffer: None,
            bytes_expected: 0,
            bytes_received: 0,
            kind: BlockKind::Unknown,
            context_lock: Semaphore::new(1),
            process_lock: Semaphore::new(1),
            ack_expected: false,
            ack_transmitted: false,
            in_progress: false,
            ack_seen: false,
        }
    }
}

impl<'b, H: LinkHooks, const N: usize> Link<'b, H, N> {
    /// Start a block reception cycle.
    ///
    /// Non blocking.  `buffer` receives the payload of a data block; pass
    /// `None` when the incoming block carries none worth keeping, as when
    /// awaiting an ACK.  Returns [`Error::Busy`] untouched if a cycle is
    /// already running.
    pub fn start_reception(&mut self, buffer: Option<&'b mut ByteBuffer<N>>) -> Result<()> {
        if !self.rx.process_lock.try_lock() {
            return Err(Error::Busy);
        }

        self.rx.buffer = buffer;
        self.rx.state = RxState::Init;
        self.rx.in_progress = true;
        self.rx.ack_seen = false;
        self.apply_rx_state(0x00)?;

        self.hooks.enable_rx_ready();
        Ok(())
    }

    /// Feed one received byte to the engine.
    ///
    /// Designed to be called from the receive interrupt.  [`Error::Busy`]
    /// means the context lock was contended and the byte was dropped; the
    /// peer has to notice and retransmit.  Any other error is fatal to the
    /// cycle and the context lock stays held until [`Link::reset`].
    pub fn on_byte_received(&mut self, byte: u8) -> Result<()> {
        if !self.rx.in_progress {
            return Err(Error::Idle);
        }

        if !self.rx.context_lock.try_lock() {
            warn!("rx byte dropped: context busy");
            return Err(Error::Busy);
        }

        let next = self.next_rx_state()?;
        self.rx.state = next;
        self.apply_rx_state(byte)?;

        self.rx.context_lock.release();
        Ok(())
    }

    fn next_rx_state(&self) -> Result<RxState> {
        let rx = &self.rx;
        Ok(match rx.state {
            RxState::Init => RxState::CtrlByte,
            RxState::CtrlByte => match rx.kind {
                BlockKind::Data => RxState::LenByte1,
                _ => RxState::Check,
            },
            RxState::LenByte1 => RxState::LenByte2,
            RxState::LenByte2 => RxState::LenByte3,
            RxState::LenByte3 => {
                if rx.bytes_expected == 0 {
                    RxState::Check
                } else {
                    RxState::Data
                }
            }
            RxState::Data => {
                if rx.bytes_received < rx.bytes_expected {
                    RxState::Data
                } else if rx.bytes_received == rx.bytes_expected {
                    RxState::Check
                } else {
                    return Err(Error::State);
                }
            }
            RxState::Check => {
                if rx.ack_expected {
                    // The reply ACK for our own transmission lands in this
                    // same cycle.
                    RxState::AckCtrlByte
                } else if rx.kind.needs_ack() && rx.ack_transmitted {
                    RxState::TransmittedAck
                } else {
                    RxState::Check
                }
            }
            RxState::AckCtrlByte => RxState::AckCheck,
            RxState::AckCheck => {
                if rx.kind.needs_ack() && rx.ack_transmitted {
                    RxState::TransmittedAck
                } else {
                    RxState::AckCheck
                }
            }
            RxState::TransmittedAck => RxState::TransmittedAck,
        })
    }

    fn apply_rx_state(&mut self, byte: u8) -> Result<()> {
        match self.rx.state {
            RxState::Init => {
                self.rx.bytes_received = 0;
                self.rx.bytes_expected = 0;
                self.rx.kind = BlockKind::Unknown;
                Ok(())
            }
            RxState::CtrlByte => {
                self.rx.kind = BlockKind::from_wire(byte);
                // A data payload is about to land, make room.
                if self.rx.kind == BlockKind::Data {
                    if let Some(buf) = self.rx.buffer.as_deref_mut() {
                        buf.clear();
                    }
                }
                Ok(())
            }
            RxState::LenByte1 => {
                self.rx.bytes_expected |= (byte as u32) << 16;
                Ok(())
            }
            RxState::LenByte2 => {
                self.rx.bytes_expected |= (byte as u32) << 8;
                Ok(())
            }
            RxState::LenByte3 => {
                self.rx.bytes_expected |= byte as u32;
                Ok(())
            }
            RxState::Data => {
                match self.rx.buffer.as_deref_mut() {
                    Some(buf) => buf.enqueue(byte)?,
                    None => return Err(Error::State),
                }
                self.rx.bytes_received += 1;
                Ok(())
            }
            RxState::Check => self.apply_rx_check(),
            RxState::AckCtrlByte => {
                if BlockKind::from_wire(byte) != BlockKind::Ack {
                    warn!("framing desync: expected ACK tag");
                    return Err(Error::BadAck);
                }
                Ok(())
            }
            RxState::AckCheck => self.apply_rx_ack_check(),
            RxState::TransmittedAck => {
                self.rx.ack_transmitted = false;
                self.end_rx_cycle()
            }
        }
    }

    /// Entry action of `Check`: the check byte itself is a placeholder and
    /// is not verified.  This is where the cycle decides how to finish.
    fn apply_rx_check(&mut self) -> Result<()> {
        let needs_ack = self.rx.kind.needs_ack();

        if self.rx.kind == BlockKind::Ack && self.rx.ack_expected {
            self.ack_block_received()?;
        }

        if self.rx.ack_expected {
            // Still owed an ACK by the peer; it will arrive into this
            // cycle through the AckCtrlByte branch.
        } else if !needs_ack {
            self.end_rx_cycle()?;
        } else {
            // The block we just took requires a reply ACK.  Busy is fine
            // here: the transmission engine flushes the pending ACK from
            // its own completion path once it frees up.
            self.tx.ack_expected = true;
            match self.send_block(None, BlockKind::Ack) {
                Ok(()) | Err(Error::Busy) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Entry action of `AckCheck`: the awaited ACK is fully in.
    fn apply_rx_ack_check(&mut self) -> Result<()> {
        self.ack_block_received()?;

        if self.rx.kind.needs_ack() {
            // The block this cycle carried still wants its own reply ACK.
            self.tx.ack_expected = true;
            match self.send_block(None, BlockKind::Ack) {
                Ok(()) | Err(Error::Busy) => {}
                Err(err) => return Err(err),
            }
            Ok(())
        } else {
            self.end_rx_cycle()
        }
    }

    /// The peer's ACK for our outstanding transmission has been consumed.
    /// Hand the news to the transmission engine and drive it one step so
    /// it can close its cycle immediately.
    fn ack_block_received(&mut self) -> Result<()> {
        self.rx.ack_seen = true;

        if !self.rx.ack_expected {
            return Err(Error::State);
        }
        self.rx.ack_expected = false;
        self.tx.ack_received = true;

        self.next_byte_to_send()?;
        Ok(())
    }

    /// Close out a reception cycle: free the process lock, fire the
    /// callbacks, gate the interrupt off, and chain straight into an ACK
    /// wait if the transmission engine still expects one.
    pub(crate) fn end_rx_cycle(&mut self) -> Result<()> {
        let kind = self.rx.kind;

        self.rx.process_lock.release();
        self.rx.in_progress = false;

        if self.rx.ack_seen {
            self.hooks.ack_acknowledged();
        }

        match kind {
            BlockKind::Ack => {}
            BlockKind::Data => self.hooks.data_block_received(),
            BlockKind::ColdReset => {
                self.hooks.ctrl_block_received();
                self.hooks.cold_reset_received();
            }
            BlockKind::WarmReset => {
                self.hooks.ctrl_block_received();
                self.hooks.warm_reset_received();
            }
            BlockKind::Unknown => {
                self.hooks.ctrl_block_received();
                self.hooks.unknown_block_received();
            }
            BlockKind::Busy | BlockKind::Nack => self.hooks.ctrl_block_received(),
        }

        self.hooks.block_received(kind);
        self.hooks.disable_rx_ready();

        if self.rx.ack_expected {
            // Our transmission is still waiting on its reply ACK; go
            // receive it, reusing whatever buffer this cycle had.
            let buffer = self.rx.buffer.take();
            self.start_reception(buffer)?;
        }
        Ok(())
    }
}
