//! Block transmission engine.
//!
//! The mirror image of the reception engine: every transmit-ready event
//! asks this machine for the next byte to put on the wire.  After the check
//! byte of an acknowledged kind goes out, the cycle stays open until the
//! peer's ACK comes back through the reception engine; if this side owes
//! the peer an ACK of its own, that ACK rides out immediately behind the
//! current block through the `AckCtrlByte`/`AckCheck` branch.

use crate::buffer::ByteBuffer;
use crate::log::warn;
use crate::sem::Semaphore;
use crate::{BlockKind, Error, Link, LinkHooks, Result};

/// Transmission engine states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TxState {
    Init,
    CtrlByte,
    LenByte1,
    LenByte2,
    LenByte3,
    Data,
    Check,
    RcvdAck,
    AckCtrlByte,
    AckCheck,
}

/// Everything one transmission cycle needs, plus the flags the reception
/// engine signals through.
pub(crate) struct Transmission<'b, const N: usize> {
    pub(crate) state: TxState,
    /// Source of payload bytes, drained as they are emitted.  Absent for
    /// control-only blocks.
    pub(crate) buffer: Option<&'b mut ByteBuffer<N>>,
    pub(crate) kind: BlockKind,
    pub(crate) context_lock: Semaphore,
    pub(crate) process_lock: Semaphore,
    /// Set by the reception engine when the peer's ACK for the block we
    /// sent has been consumed.
    pub(crate) ack_received: bool,
    /// This engine owes the peer an ACK for a block the reception engine
    /// took.
    pub(crate) ack_expected: bool,
    /// Nothing further to emit in this cycle.
    pub(crate) done: bool,
    pub(crate) in_progress: bool,
}

impl<'b, const N: usize> Transmission<'b, N> {
    pub(crate) fn new() -> Self {
        Transmission {
            state: TxState::Init,
            buffer: None,
            kind: BlockKind::Unknown,
            context_lock: Semaphore::new(1),
            process_lock: Semaphore::new(1),
            ack_received: false,
            ack_expected: false,
            done: false,
            in_progress: false,
        }
    }
}

impl<'b, H: LinkHooks, const N: usize> Link<'b, H, N> {
    /// Start a block transmission cycle.
    ///
    /// The buffer is borrowed, not copied; it is drained as the bytes go
    /// out, so it must not be touched until the cycle completes.  Pass
    /// `None` for control-only blocks.  Returns [`Error::Busy`] with
    /// nothing mutated while another transmission is in flight.
    pub fn send_block(
        &mut self,
        buffer: Option<&'b mut ByteBuffer<N>>,
        kind: BlockKind,
    ) -> Result<()> {
        if kind == BlockKind::Unknown {
            return Err(Error::BadBlockType);
        }
        if !self.tx.process_lock.try_lock() {
            return Err(Error::Busy);
        }

        self.tx.done = false;
        self.tx.in_progress = true;
        self.tx.buffer = buffer;
        self.tx.kind = kind;
        self.tx.state = TxState::Init;
        self.apply_tx_state()?;

        self.hooks.enable_tx_ready();
        Ok(())
    }

    /// Produce the next byte to put on the wire.
    ///
    /// Designed to be called from the transmit-ready interrupt.
    /// [`Error::Busy`] on context contention is harmless: the interrupt
    /// fires again while the condition is still present.  `Ok(None)` means
    /// this step was cycle bookkeeping with nothing to emit.
    pub fn next_byte_to_send(&mut self) -> Result<Option<u8>> {
        if !self.tx.in_progress {
            return Err(Error::Idle);
        }

        if !self.tx.context_lock.try_lock() {
            warn!("tx step skipped: context busy");
            return Err(Error::Busy);
        }

        let next = self.next_tx_state()?;
        self.tx.state = next;
        let byte = self.apply_tx_state()?;

        // A nested ACK send may have re-armed the cycle; only gate the
        // interrupt off if this one is really finished.
        if self.tx.done {
            self.hooks.disable_tx_ready();
        }

        self.tx.context_lock.release();
        Ok(byte)
    }

    fn next_tx_state(&self) -> Result<TxState> {
        let tx = &self.tx;
        Ok(match tx.state {
            TxState::Init => TxState::CtrlByte,
            TxState::CtrlByte => match tx.kind {
                BlockKind::Data => TxState::LenByte1,
                BlockKind::Unknown => return Err(Error::BadBlockType),
                _ => TxState::Check,
            },
            TxState::LenByte1 => TxState::LenByte2,
            TxState::LenByte2 => TxState::LenByte3,
            TxState::LenByte3 | TxState::Data => {
                let empty = match tx.buffer.as_ref() {
                    Some(buf) => buf.is_empty(),
                    None => return Err(Error::State),
                };
                if empty {
                    TxState::Check
                } else {
                    TxState::Data
                }
            }
            TxState::Check => {
                if tx.ack_expected {
                    // The reply ACK we owe goes out right behind this
                    // block.
                    TxState::AckCtrlByte
                } else if tx.kind.needs_ack() && tx.ack_received {
                    TxState::RcvdAck
                } else {
                    TxState::Check
                }
            }
            TxState::AckCtrlByte => TxState::AckCheck,
            TxState::AckCheck => {
                if tx.kind.needs_ack() && tx.ack_received {
                    TxState::RcvdAck
                } else {
                    TxState::AckCheck
                }
            }
            TxState::RcvdAck => TxState::RcvdAck,
        })
    }

    fn apply_tx_state(&mut self) -> Result<Option<u8>> {
        match self.tx.state {
            TxState::Init => {
                self.tx.ack_received = false;
                Ok(None)
            }
            TxState::CtrlByte => Ok(Some(self.tx.kind.to_wire())),
            TxState::LenByte1 => self.tx_len_byte(16),
            TxState::LenByte2 => self.tx_len_byte(8),
            TxState::LenByte3 => self.tx_len_byte(0),
            TxState::Data => {
                let byte = match self.tx.buffer.as_deref_mut() {
                    Some(buf) => buf.dequeue()?,
                    None => return Err(Error::State),
                };
                Ok(Some(byte))
            }
            TxState::Check => self.apply_tx_check(),
            TxState::AckCtrlByte => Ok(Some(BlockKind::Ack.to_wire())),
            TxState::AckCheck => self.apply_tx_ack_check(),
            TxState::RcvdAck => {
                self.tx.ack_received = false;
                self.end_tx_cycle()?;
                Ok(None)
            }
        }
    }

    /// One of the three big endian length bytes, read live from the
    /// buffer's occupancy.
    fn tx_len_byte(&self, shift: u32) -> Result<Option<u8>> {
        let len = match self.tx.buffer.as_ref() {
            Some(buf) => buf.len() as u32,
            None => return Err(Error::State),
        };
        Ok(Some((len >> shift) as u8))
    }

    /// Entry action of `Check`: emit the placeholder check byte and decide
    /// how the cycle continues.
    fn apply_tx_check(&mut self) -> Result<Option<u8>> {
        if self.tx.kind == BlockKind::Ack && self.tx.ack_expected {
            self.ack_block_transmitted()?;
        }

        let needs_ack = self.tx.kind.needs_ack();
        if self.tx.ack_expected {
            // An owed reply ACK is queued; the cycle keeps going into the
            // AckCtrlByte branch instead of finishing here.
        } else {
            self.tx.done = true;
            if !needs_ack {
                self.end_tx_cycle()?;
            } else {
                // Our block wants a reply ACK; go receive it.  Busy means
                // a reception is already running and will pick the ACK up
                // within its own cycle.
                self.rx.ack_expected = true;
                match self.start_reception(None) {
                    Ok(()) | Err(Error::Busy) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(Some(0x00))
    }

    /// Entry action of `AckCheck`: the piggybacked reply ACK is fully out.
    fn apply_tx_ack_check(&mut self) -> Result<Option<u8>> {
        self.tx.done = true;
        self.ack_block_transmitted()?;

        if self.tx.kind.needs_ack() {
            // The block this cycle carried still awaits the peer's ACK.
            self.rx.ack_expected = true;
            match self.start_reception(None) {
                Ok(()) | Err(Error::Busy) => {}
                Err(err) => return Err(err),
            }
        } else {
            self.end_tx_cycle()?;
        }
        Ok(Some(0x00))
    }

    /// The reply ACK the reception engine was owed has been pushed out.
    /// Hand the news over and drive the reception engine one step so it
    /// can close its cycle immediately.
    fn ack_block_transmitted(&mut self) -> Result<()> {
        if !self.tx.ack_expected {
            return Err(Error::State);
        }
        self.tx.ack_expected = false;
        self.rx.ack_transmitted = true;

        self.on_byte_received(0x00)?;
        Ok(())
    }

    /// Close out a transmission cycle: free the process lock, report the
    /// block as sent, and chain straight into the pending reply ACK if the
    /// reception engine queued one up meanwhile.
    pub(crate) fn end_tx_cycle(&mut self) -> Result<()> {
        self.tx.process_lock.release();
        self.tx.in_progress = false;

        self.hooks.block_sent(self.tx.kind);

        if self.tx.ack_expected {
            self.send_block(None, BlockKind::Ack)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::TxState;
    use crate::testlog;
    use crate::{BlockKind, ByteBuffer, Error, Link, LinkHooks};

    #[derive(Default)]
    struct Probe {
        received: u32,
        sent: u32,
        sent_kinds: Vec<BlockKind>,
        acked: u32,
        tx_irq: bool,
    }

    impl LinkHooks for Probe {
        fn enable_tx_ready(&mut self) {
            self.tx_irq = true;
        }
        fn disable_tx_ready(&mut self) {
            self.tx_irq = false;
        }
        fn block_received(&mut self, _kind: BlockKind) {
            self.received += 1;
        }
        fn ack_acknowledged(&mut self) {
            self.acked += 1;
        }
        fn block_sent(&mut self, kind: BlockKind) {
            self.sent += 1;
            self.sent_kinds.push(kind);
        }
    }

    fn pump<const N: usize>(link: &mut Link<'_, Probe, N>, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..count {
            if let Some(byte) = link.next_byte_to_send().unwrap() {
                out.push(byte);
            }
        }
        out
    }

    fn feed<const N: usize>(link: &mut Link<'_, Probe, N>, bytes: &[u8]) {
        for &byte in bytes {
            link.on_byte_received(byte).unwrap();
        }
    }

    fn loaded_buffer<const N: usize>(bytes: &[u8]) -> ByteBuffer<N> {
        let mut buf = ByteBuffer::new();
        buf.extend_from_slice(bytes).unwrap();
        buf
    }

    #[test]
    fn send_data_block() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(b"test");
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut src), BlockKind::Data).unwrap();
        assert!(link.hooks().tx_irq);

        assert_eq!(
            pump(&mut link, 9),
            vec![0x00, 0x00, 0x00, 0x04, b't', b'e', b's', b't', 0x00]
        );

        // The ACK is still outstanding.
        assert_eq!(link.hooks().sent, 0);
        assert!(!link.hooks().tx_irq);

        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 1);
        assert_eq!(link.hooks().sent_kinds, vec![BlockKind::Data]);
        assert_eq!(link.hooks().acked, 1);
    }

    #[test]
    fn block_sent_fires_only_after_full_ack() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(&[0xAB, 0xCD]);
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut src), BlockKind::Data).unwrap();
        assert_eq!(
            pump(&mut link, 7),
            vec![0x00, 0x00, 0x00, 0x02, 0xAB, 0xCD, 0x00]
        );

        link.on_byte_received(0x05).unwrap();
        assert_eq!(link.hooks().sent, 0);
        link.on_byte_received(0x00).unwrap();
        assert_eq!(link.hooks().sent, 1);
    }

    #[test]
    fn two_sends_in_a_row() {
        testlog::setup();
        let mut first = loaded_buffer::<32>(b"test");
        let mut second = loaded_buffer::<32>(b"ABC");
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut first), BlockKind::Data).unwrap();
        assert_eq!(
            pump(&mut link, 9),
            vec![0x00, 0x00, 0x00, 0x04, b't', b'e', b's', b't', 0x00]
        );
        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 1);

        link.send_block(Some(&mut second), BlockKind::Data).unwrap();
        assert_eq!(
            pump(&mut link, 8),
            vec![0x00, 0x00, 0x00, 0x03, b'A', b'B', b'C', 0x00]
        );
        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 2);
    }

    #[test]
    fn send_empty_data_block() {
        testlog::setup();
        let mut src = ByteBuffer::<32>::new();
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut src), BlockKind::Data).unwrap();
        assert_eq!(pump(&mut link, 5), vec![0x00, 0x00, 0x00, 0x00, 0x00]);

        assert_eq!(link.hooks().sent, 0);
        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 1);
    }

    #[test]
    fn send_cold_reset_block() {
        testlog::setup();
        let mut link: Link<'_, Probe, 32> = Link::new(Probe::default());

        link.send_block(None, BlockKind::ColdReset).unwrap();
        assert_eq!(pump(&mut link, 2), vec![0x02, 0x00]);

        assert_eq!(link.hooks().sent, 0);
        assert_eq!(link.hooks().acked, 0);
        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 1);
        assert_eq!(link.hooks().acked, 1);
    }

    #[test]
    fn busy_block_needs_no_ack() {
        testlog::setup();
        let mut link: Link<'_, Probe, 32> = Link::new(Probe::default());

        link.send_block(None, BlockKind::Busy).unwrap();
        assert_eq!(link.hooks().sent, 0);

        assert_eq!(pump(&mut link, 2), vec![0x04, 0x00]);

        // Complete without any ACK round trip.
        assert_eq!(link.hooks().sent, 1);
        assert!(!link.rx.ack_expected);

        // And the engine is free again right away.
        link.send_block(None, BlockKind::Busy).unwrap();
    }

    #[test]
    fn send_calls_serialize_on_acked_blocks() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(b"test");
        let mut other = ByteBuffer::<32>::new();
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut src), BlockKind::Data).unwrap();
        assert_eq!(
            link.send_block(Some(&mut other), BlockKind::Data),
            Err(Error::Busy)
        );

        let wire = pump(&mut link, 9);
        assert_eq!(wire[0], 0x00);
        assert_eq!(wire.len(), 9);

        // Still busy: the ACK has not come back.
        assert_eq!(link.send_block(None, BlockKind::Data), Err(Error::Busy));

        feed(&mut link, &[0x05, 0x00]);

        // Free again.
        link.send_block(None, BlockKind::ColdReset).unwrap();
    }

    #[test]
    fn send_unknown_is_rejected() {
        testlog::setup();
        let mut link: Link<'_, Probe, 32> = Link::new(Probe::default());
        assert_eq!(
            link.send_block(None, BlockKind::Unknown),
            Err(Error::BadBlockType)
        );
        // Nothing was locked by the failed call.
        link.send_block(None, BlockKind::Busy).unwrap();
    }

    #[test]
    fn next_byte_without_transmission_is_idle() {
        testlog::setup();
        let mut link: Link<'_, Probe, 32> = Link::new(Probe::default());
        assert_eq!(link.next_byte_to_send(), Err(Error::Idle));
    }

    #[test]
    fn context_lock_contention_skips_the_step() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(b"test");
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut src), BlockKind::Data).unwrap();
        assert_eq!(
            pump(&mut link, 8),
            vec![0x00, 0x00, 0x00, 0x04, b't', b'e', b's', b't']
        );

        // Emulate nested delivery while a step is in progress.
        assert!(link.tx.context_lock.try_lock());
        assert_eq!(link.next_byte_to_send(), Err(Error::Busy));
        assert_eq!(link.tx.state, TxState::Data);
        link.tx.context_lock.release();

        // The transmit interrupt re-fires and the cycle continues.
        assert_eq!(pump(&mut link, 1), vec![0x00]);
        assert_eq!(link.tx.state, TxState::Check);
    }

    #[test]
    fn length_bytes_encode_the_payload_size() {
        testlog::setup();
        for (size, expected) in [
            (0usize, [0x00u8, 0x00, 0x00]),
            (1, [0x00, 0x00, 0x01]),
            (255, [0x00, 0x00, 0xFF]),
            (65536, [0x01, 0x00, 0x00]),
            (69999, [0x01, 0x11, 0x6F]),
        ] {
            let payload = vec![0x5A; size];
            let mut src = Box::new(ByteBuffer::<70000>::new());
            src.extend_from_slice(&payload).unwrap();
            let mut link = Link::new(Probe::default());

            link.send_block(Some(&mut *src), BlockKind::Data).unwrap();
            let head = pump(&mut link, 4);
            assert_eq!(head[0], 0x00);
            assert_eq!(&head[1..], &expected);
        }
    }

    #[test]
    fn interleave_reception_completes_first() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(b"test");
        let mut dest = ByteBuffer::<32>::new();
        let mut link = Link::new(Probe::default());

        link.start_reception(Some(&mut dest)).unwrap();
        link.send_block(Some(&mut src), BlockKind::Data).unwrap();

        // The peer's whole data block lands before we emit anything.
        feed(&mut link, &[0x00, 0x00, 0x00, 0x02, 0xAB, 0xCD, 0x00]);

        // Our own block goes out; the reply ACK we owe is queued behind it.
        assert_eq!(
            pump(&mut link, 9),
            vec![0x00, 0x00, 0x00, 0x04, b't', b'e', b's', b't', 0x00]
        );
        assert_eq!(link.hooks().sent, 0);
        assert_eq!(link.hooks().received, 0);

        // The owed ACK rides out right behind the data block.
        assert_eq!(pump(&mut link, 2), vec![0x05, 0x00]);
        assert_eq!(link.hooks().received, 1);
        assert_eq!(link.hooks().sent, 0);

        // The peer finally acknowledges our block.
        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 1);

        // The ACK wait ran without a buffer, so the payload is read from
        // the destination directly once the link lets go of it.
        drop(link);
        assert_eq!(dest.dequeue(), Ok(0xAB));
        assert_eq!(dest.dequeue(), Ok(0xCD));
    }

    #[test]
    fn interleave_transmission_completes_first() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(b"test");
        let mut dest = ByteBuffer::<32>::new();
        let mut link = Link::new(Probe::default());

        link.start_reception(Some(&mut dest)).unwrap();
        link.send_block(Some(&mut src), BlockKind::Data).unwrap();

        // The peer's block is cut off after its length field.
        feed(&mut link, &[0x00, 0x00, 0x00, 0x02]);

        // Our block goes out completely; the ACK wait folds into the
        // reception already in progress.
        assert_eq!(
            pump(&mut link, 9),
            vec![0x00, 0x00, 0x00, 0x04, b't', b'e', b's', b't', 0x00]
        );
        assert_eq!(link.hooks().sent, 0);

        // The rest of the peer's payload arrives.
        feed(&mut link, &[0xAB, 0xCD, 0x00]);
        assert_eq!(link.hooks().received, 0);

        // Then the peer's ACK for our block, inside the same reception
        // cycle.
        feed(&mut link, &[0x05, 0x00]);
        assert_eq!(link.hooks().sent, 1);
        assert_eq!(link.hooks().acked, 0);

        // Our reply ACK for the peer's data block flushes now.
        assert_eq!(pump(&mut link, 2), vec![0x05, 0x00]);
        assert_eq!(link.hooks().received, 1);
        // The deferred ACK reception is only reported once its cycle ends.
        assert_eq!(link.hooks().acked, 1);

        let buf = link.rx_buffer_mut().unwrap();
        assert_eq!(buf.dequeue(), Ok(0xAB));
        assert_eq!(buf.dequeue(), Ok(0xCD));
    }

    #[test]
    fn foreign_block_instead_of_ack_keeps_waiting() {
        testlog::setup();
        let mut src = loaded_buffer::<32>(b"test");
        let mut link = Link::new(Probe::default());

        link.send_block(Some(&mut src), BlockKind::Data).unwrap();
        pump(&mut link, 9);

        // A cold reset shows up where the ACK was expected.  The cycle
        // keeps waiting rather than completing.
        feed(&mut link, &[0x02, 0x00]);
        assert_eq!(link.hooks().sent, 0);
    }

    #[test]
    fn unexpected_ack_does_not_complete_anything() {
        testlog::setup();
        let mut dest = ByteBuffer::<32>::new();
        let mut link = Link::new(Probe::default());

        link.start_reception(Some(&mut dest)).unwrap();
        feed(&mut link, &[0x05, 0x00]);

        // The ACK block completes as a reception, but nobody was waiting
        // on it.
        assert_eq!(link.hooks().received, 1);
        assert_eq!(link.hooks().acked, 0);
        assert_eq!(link.hooks().sent, 0);
    }
}
