//! Test doubles for the control bus, pins, ready line and update sink.
//!
//! [`MockSpi`] captures everything the drivers shift out and answers reads
//! three ways: 4-byte PMU frames echo their own payload back (so
//! write-verify sequences succeed without a script per readback), 1-byte
//! commands address a small amplifier register file, and everything else is
//! served from scripted data. Error injection flags cover the failure
//! paths.

use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::spi::{self, SpiBus};

use crate::ad7177::ReadyLine;
use crate::publish::UpdateSink;

#[derive(Debug)]
pub struct MockSpiError;

impl spi::Error for MockSpiError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

pub struct MockSpi {
    /// Every byte shifted out, in order.
    pub written: heapless::Vec<u8, 2048>,
    /// Every 4-byte PMU frame, reads included.
    pub pmu_frames: heapless::Vec<u32, 64>,
    /// Simulate bus write failures.
    pub fail_writes: bool,
    /// Flip a bit in every readback.
    pub corrupt_reads: bool,
    /// Payload of the most recent PMU write frame, echoed on 3-byte reads.
    pmu_payload: u32,
    /// Command byte of an in-flight 1-byte-addressed transfer.
    pending_cmd: Option<u8>,
    /// Amplifier register file.
    amp_regs: [u8; 0x40],
    /// Scripted read data for everything else (ADC data frames).
    read_data: heapless::Vec<u8, 256>,
    read_pos: usize,
}

impl MockSpi {
    pub fn new() -> Self {
        let mut amp_regs = [0u8; 0x40];
        amp_regs[0x2F] = 0x30;
        Self {
            written: heapless::Vec::new(),
            pmu_frames: heapless::Vec::new(),
            fail_writes: false,
            corrupt_reads: false,
            pmu_payload: 0,
            pending_cmd: None,
            amp_regs,
            read_data: heapless::Vec::new(),
            read_pos: 0,
        }
    }

    /// Append scripted read data.
    pub fn script_read(&mut self, data: &[u8]) {
        self.read_data
            .extend_from_slice(data)
            .expect("mock read script full");
    }

    /// Current value of an amplifier register.
    pub fn amp_reg(&self, addr: u8) -> u8 {
        self.amp_regs[addr as usize]
    }

    /// Override the amplifier identity register.
    pub fn set_amp_id(&mut self, id: u8) {
        self.amp_regs[0x2F] = id;
    }

    fn capture(&mut self, words: &[u8]) {
        self.written
            .extend_from_slice(words)
            .expect("mock write log full");
    }

    fn serve_scripted(&mut self, buf: &mut [u8]) {
        for slot in buf.iter_mut() {
            *slot = if self.read_pos < self.read_data.len() {
                let byte = self.read_data[self.read_pos];
                self.read_pos += 1;
                byte
            } else {
                0
            };
        }
    }

    fn corrupt(&self, value: u8) -> u8 {
        if self.corrupt_reads { value ^ 0x01 } else { value }
    }
}

impl spi::ErrorType for MockSpi {
    type Error = MockSpiError;
}

impl SpiBus<u8> for MockSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        if words.len() == 3 {
            // PMU readback phase: echo the last written payload.
            let payload = self.pmu_payload;
            words[0] = (payload >> 16) as u8;
            words[1] = (payload >> 8) as u8;
            words[2] = self.corrupt(payload as u8);
        } else {
            self.serve_scripted(words);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(MockSpiError);
        }
        self.capture(words);
        match words.len() {
            4 => {
                let frame = u32::from_be_bytes([words[0], words[1], words[2], words[3]]);
                self.pmu_frames.push(frame).expect("mock frame log full");
                if frame >> 28 & 1 == 0 {
                    self.pmu_payload = frame & 0x3F_FFFF;
                }
            }
            1 => self.pending_cmd = Some(words[0]),
            _ => {}
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(MockSpiError);
        }
        self.capture(write);
        let cmd = self.pending_cmd.take();
        match cmd {
            // 1-byte-addressed register file (the amplifier protocol).
            Some(cmd) if read.len() == 1 => {
                let addr = (cmd & 0x7F) as usize % self.amp_regs.len();
                if cmd & 0x80 != 0 {
                    read[0] = self.corrupt(self.amp_regs[addr]);
                } else {
                    read[0] = self.amp_regs[addr];
                    self.amp_regs[addr] = write[0];
                }
            }
            _ => self.serve_scripted(read),
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(MockSpiError);
        }
        let mut out = [0u8; 8];
        let n = words.len().min(out.len());
        out[..n].copy_from_slice(&words[..n]);
        self.capture(&out[..n]);
        self.serve_scripted(words);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Output pin double tracking its level.
#[derive(Debug, Default)]
pub struct MockPin {
    pub high: bool,
}

impl digital::ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        Ok(())
    }
}

/// Busy/ready input double. Ready by default; [`MockBusyPin::never_ready`]
/// exercises the timeout path.
#[derive(Debug, Default)]
pub struct MockBusyPin {
    never_ready: bool,
}

impl MockBusyPin {
    pub fn never_ready() -> Self {
        Self { never_ready: true }
    }
}

impl digital::ErrorType for MockBusyPin {
    type Error = Infallible;
}

impl InputPin for MockBusyPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.never_ready)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.never_ready)
    }
}

#[derive(Debug, Default)]
pub struct MockDelay;

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Ready-line double tracking the edge mask and select level.
#[derive(Debug, Default)]
pub struct MockReadyLine {
    pub irq: AtomicBool,
    pub selected: AtomicBool,
}

impl ReadyLine for MockReadyLine {
    fn irq_enable(&self) {
        self.irq.store(true, Ordering::SeqCst);
    }

    fn irq_disable(&self) {
        self.irq.store(false, Ordering::SeqCst);
    }

    fn select(&self) {
        self.selected.store(true, Ordering::SeqCst);
    }

    fn deselect(&self) {
        self.selected.store(false, Ordering::SeqCst);
    }
}

/// Update sink collecting published payloads.
#[derive(Debug, Default)]
pub struct MockSink {
    pub messages: heapless::Vec<heapless::String<512>, 8>,
}

impl UpdateSink for MockSink {
    fn send(&mut self, payload: &str) {
        let mut message = heapless::String::new();
        message.push_str(payload).expect("mock payload too long");
        self.messages.push(message).expect("mock sink full");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmu_frames_echo_their_payload() {
        let mut spi = MockSpi::new();
        spi.write(&[0x01, 0xD5, 0x12, 0x34]).unwrap();
        let mut rx = [0u8; 3];
        spi.read(&mut rx).unwrap();
        // Low 22 bits of the frame come back.
        assert_eq!(rx, [0x15, 0x12, 0x34]);
    }

    #[test]
    fn read_frames_do_not_disturb_the_echo() {
        let mut spi = MockSpi::new();
        spi.write(&[0x01, 0xD5, 0x12, 0x34]).unwrap();
        spi.write(&[0x11, 0xD5, 0x00, 0x00]).unwrap();
        let mut rx = [0u8; 3];
        spi.read(&mut rx).unwrap();
        assert_eq!(rx, [0x15, 0x12, 0x34]);
    }

    #[test]
    fn amp_register_file_round_trips() {
        let mut spi = MockSpi::new();
        spi.write(&[0x06]).unwrap();
        spi.transfer(&mut [0u8], &[0x41]).unwrap();

        spi.write(&[0x86]).unwrap();
        let mut rx = [0u8];
        spi.transfer(&mut rx, &[0x00]).unwrap();
        assert_eq!(rx[0], 0x41);
        assert_eq!(spi.amp_reg(0x06), 0x41);
    }

    #[test]
    fn scripted_reads_serve_in_order() {
        let mut spi = MockSpi::new();
        spi.script_read(&[1, 2, 3, 4, 5, 6]);
        spi.write(&[0x44]).unwrap();
        let mut rx = [0u8; 4];
        spi.transfer(&mut rx, &[0, 0, 0, 0]).unwrap();
        assert_eq!(rx, [1, 2, 3, 4]);
        let mut rest = [0u8; 4];
        spi.transfer(&mut rest, &[0, 0, 0, 0]).unwrap();
        assert_eq!(rest, [5, 6, 0, 0]);
    }
}
