//! The 9-bit word link.
//!
//! MDB words are 8 data bits plus a ninth "mode" bit. Nothing at this layer
//! knows about frames or checksums: a [`BitLink`] moves exactly one [`Word9`]
//! at a time, and the framing above recovers everything else.
//!
//! Two transports are provided. [`BitBangLink`] drives a GPIO pair with
//! cycle-accurate 9600 bps timing, the way the line is wired on boards with
//! no 9-bit-capable UART. [`UartLink`] rides a hardware UART whose driver
//! reports the ninth bit through a companion byte (typically recovered from
//! the parity flag), so each word crosses the host interface as a byte pair.

use embassy_time::Timer;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use embedded_hal_async::digital::Wait;
use embedded_io_async::{Read, ReadExactError, Write};

/// Bit cell at 9600 bps, in microseconds.
const BIT_US: u64 = 104;

/// One transported unit: 8 data bits plus the out-of-band mode flag.
///
/// The sender raises the mode flag on the byte that delimits a frame (the
/// address byte in the VMC direction, the checksum byte in the peripheral
/// direction); receivers recover it independently of the data value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Word9 {
    pub data: u8,
    pub mode: bool,
}

impl Word9 {
    pub const fn new(data: u8, mode: bool) -> Self {
        Self { data, mode }
    }

    /// A word with the mode flag clear.
    pub const fn plain(data: u8) -> Self {
        Self { data, mode: false }
    }

    /// A word with the mode flag set.
    pub const fn flagged(data: u8) -> Self {
        Self { data, mode: true }
    }

    /// Pack into the 9-bit line representation, mode flag in bit 8.
    pub const fn to_bits(self) -> u16 {
        (self.mode as u16) << 8 | self.data as u16
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self {
            data: bits as u8,
            mode: bits & 0x100 != 0,
        }
    }
}

/// Errors of the word link, wrapping the transport's own error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum LinkError<E> {
    /// The underlying serial hardware failed.
    Serial(E),
    /// The transport closed mid-word.
    Eof,
}

impl<E> From<E> for LinkError<E> {
    fn from(value: E) -> Self {
        Self::Serial(value)
    }
}

/// A half-duplex transport for single 9-bit words.
///
/// Implementations are not reentrant: exactly one call site may drive a link
/// at a time, which the sequencer/responder loops guarantee by ownership.
pub trait BitLink {
    type LinkError;

    /// Transmit one word and return once it is fully on the wire.
    async fn send(&mut self, word: Word9) -> Result<(), Self::LinkError>;

    /// Block until a start condition is observed, then return the next word.
    async fn recv(&mut self) -> Result<Word9, Self::LinkError>;
}

/// Bit-banged GPIO link: start bit, 8 data bits LSB first, the mode bit,
/// stop bit, every cell lasting one 9600 bps bit time.
pub struct BitBangLink<I, O> {
    rx: I,
    tx: O,
}

impl<I, O> BitBangLink<I, O>
where
    I: InputPin + Wait,
    O: OutputPin + ErrorType<Error = <I as ErrorType>::Error>,
{
    /// `tx` must already be driven high (line idle).
    pub fn new(rx: I, tx: O) -> Self {
        Self { rx, tx }
    }
}

impl<I, O> BitLink for BitBangLink<I, O>
where
    I: InputPin + Wait,
    O: OutputPin + ErrorType<Error = <I as ErrorType>::Error>,
{
    type LinkError = LinkError<<I as ErrorType>::Error>;

    async fn send(&mut self, word: Word9) -> Result<(), Self::LinkError> {
        let bits = word.to_bits();
        self.tx.set_low()?; // start
        Timer::after_micros(BIT_US).await;
        for n in 0..9 {
            if bits >> n & 1 != 0 {
                self.tx.set_high()?;
            } else {
                self.tx.set_low()?;
            }
            Timer::after_micros(BIT_US).await;
        }
        self.tx.set_high()?; // stop
        Timer::after_micros(BIT_US).await;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Word9, Self::LinkError> {
        self.rx.wait_for_low().await?;
        // Skip over the start bit, landing mid-way into bit 0.
        Timer::after_micros(BIT_US + BIT_US / 2).await;
        let mut bits: u16 = 0;
        for n in 0..9 {
            if self.rx.is_high()? {
                bits |= 1 << n;
            }
            Timer::after_micros(BIT_US).await;
        }
        Ok(Word9::from_bits(bits))
    }
}

/// UART-backed link. The 9-bit UART driver exchanges each word as two bytes,
/// the first carrying the ninth (mode) bit and the second the data byte.
pub struct UartLink<T: Read + Write> {
    uart: T,
}

impl<T: Read + Write> UartLink<T> {
    pub fn new(uart: T) -> Self {
        Self { uart }
    }
}

impl<T: Read + Write> BitLink for UartLink<T> {
    type LinkError = LinkError<T::Error>;

    async fn send(&mut self, word: Word9) -> Result<(), Self::LinkError> {
        let pair = [word.mode as u8, word.data];
        self.uart.write_all(&pair).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Word9, Self::LinkError> {
        let mut pair = [0u8; 2];
        self.uart.read_exact(&mut pair).await.map_err(|e| match e {
            ReadExactError::UnexpectedEof => LinkError::Eof,
            ReadExactError::Other(e) => LinkError::Serial(e),
        })?;
        Ok(Word9::new(pair[1], pair[0] != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use std::collections::VecDeque;

    #[test]
    fn word9_bit_packing_round_trips() {
        let w = Word9::flagged(0xA5);
        assert_eq!(w.to_bits(), 0x1A5);
        assert_eq!(Word9::from_bits(0x1A5), w);

        let w = Word9::plain(0xFF);
        assert_eq!(w.to_bits(), 0x0FF);
        assert_eq!(Word9::from_bits(0x0FF), w);

        assert_eq!(Word9::from_bits(0x100), Word9::flagged(0x00));
    }

    struct LoopUart {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl embedded_io_async::ErrorType for LoopUart {
        type Error = core::convert::Infallible;
    }

    impl Read for LoopUart {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let n = buf.len().min(self.rx.len());
            for slot in buf[..n].iter_mut() {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for LoopUart {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn uart_link_sends_mode_byte_first() {
        let mut link = UartLink::new(LoopUart {
            rx: VecDeque::new(),
            tx: Vec::new(),
        });
        block_on(async {
            link.send(Word9::flagged(0x12)).await.unwrap();
            link.send(Word9::plain(0x34)).await.unwrap();
        });
        assert_eq!(link.uart.tx, [0x01, 0x12, 0x00, 0x34]);
    }

    #[test]
    fn uart_link_recovers_mode_flag() {
        let mut link = UartLink::new(LoopUart {
            rx: VecDeque::from([0x01, 0xAB, 0x00, 0xCD]),
            tx: Vec::new(),
        });
        block_on(async {
            assert_eq!(link.recv().await, Ok(Word9::flagged(0xAB)));
            assert_eq!(link.recv().await, Ok(Word9::plain(0xCD)));
            assert_eq!(link.recv().await, Err(LinkError::Eof));
        });
    }
}
