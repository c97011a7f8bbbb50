//! Driver and acquisition pipeline for the AD7177-2 delta-sigma ADC.
//!
//! The converter cycles through its enabled channels and pulls its data
//! output low when a conversion completes; with the chip select held low
//! that output doubles as the ready signal. The pipeline is split across
//! three contexts:
//!
//! * the edge interrupt calls [`Acquisition::on_data_ready`], which does no
//!   bus I/O, only masks further edges, deselects the converter and asks for
//!   the sampler task to be woken;
//! * a high-priority sampler task runs [`Ad7177::service`], which reads the
//!   status+data frame, reassembles per-channel samples and, once every
//!   active channel has reported, publishes a snapshot into a double buffer;
//! * a lower-priority task runs [`Ad7177::dispatch`] and hands the snapshot
//!   to the consumer.
//!
//! Task creation, priorities and core pinning belong to the integrator; the
//! shared state here is all atomics plus one mutex-guarded buffer, with a
//! single writer per flag (the interrupt only clears `armed`, the sampler
//! only sets it).

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embedded_hal::spi::SpiBus;
use spin::Mutex;

use crate::bus::ControlBus;
use crate::error::{Error, Result};

/// Number of converter input channels.
pub const ADC_CHANNELS: usize = 4;

mod reg {
    pub const IFMODE: u8 = 0x02;
    pub const DATA: u8 = 0x04;
    pub const GPIOCON: u8 = 0x06;
    pub const CHMAP_BASE: u8 = 0x10;
    pub const SETUPCON0: u8 = 0x20;
    pub const FILTCON0: u8 = 0x28;
}

/// Multiplexer sources for a channel's input pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdcInput {
    Ain0 = 0x00,
    Ain1 = 0x01,
    Ain2 = 0x02,
    Ain3 = 0x03,
    Ain4 = 0x04,
    TempPos = 0x11,
    TempNeg = 0x12,
    RefPos = 0x15,
    RefNeg = 0x16,
}

/// Output data rates for the setup-0 filter register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SampleRate {
    Sps10000 = 0x0507,
    Sps5000 = 0x0508,
    Sps2500 = 0x0509,
    Sps1000 = 0x050A,
    Sps500 = 0x050B,
    Sps397 = 0x050C,
    Sps200 = 0x050D,
    Sps100 = 0x050E,
    Sps60 = 0x050F,
    Sps50 = 0x0510,
    Sps20 = 0x0511,
    Sps17 = 0x0512,
    Sps10 = 0x0513,
    Sps5 = 0x0514,
}

/// Control over the data-ready edge source and the converter chip select.
///
/// The same select pin participates in ready monitoring and in register
/// transactions, so both sides go through this trait. Implementations are
/// called from interrupt context and must be interrupt-safe.
pub trait ReadyLine: Sync {
    /// Unmask the data-ready edge event.
    fn irq_enable(&self);
    /// Mask the data-ready edge event.
    fn irq_disable(&self);
    /// Assert the converter chip select.
    fn select(&self);
    /// Deassert the converter chip select.
    fn deselect(&self);
}

/// One completed acquisition group: raw 24-bit codes plus the bitmask of
/// channels that contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub samples: [u32; ADC_CHANNELS],
    pub valid: u8,
}

/// Cross-context acquisition state, shared between the interrupt handler,
/// the sampler task and the dispatcher task. Typically lives in a `static`.
pub struct Acquisition<L> {
    line: L,
    active: AtomicBool,
    armed: AtomicBool,
    discard_next: AtomicBool,
    ch_active: AtomicU8,
    ch_valid: AtomicU8,
    samples: [AtomicU32; ADC_CHANNELS],
    pending: AtomicBool,
    snapshot: Mutex<Snapshot>,
}

impl<L: ReadyLine> Acquisition<L> {
    pub const fn new(line: L) -> Self {
        Self {
            line,
            active: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            discard_next: AtomicBool::new(true),
            ch_active: AtomicU8::new(0),
            ch_valid: AtomicU8::new(0),
            samples: [const { AtomicU32::new(0) }; ADC_CHANNELS],
            pending: AtomicBool::new(false),
            snapshot: Mutex::new(Snapshot {
                samples: [0; ADC_CHANNELS],
                valid: 0,
            }),
        }
    }

    /// Interrupt entry for the data-ready edge.
    ///
    /// Masks further edges and deselects the converter so the upcoming
    /// register read does not contend with the conversion output, then
    /// reports whether the sampler task must be woken. No bus I/O, never
    /// blocks.
    pub fn on_data_ready(&self) -> bool {
        if self.active.load(Ordering::Acquire) && self.armed.swap(false, Ordering::AcqRel) {
            self.line.irq_disable();
            self.line.deselect();
            true
        } else {
            false
        }
    }

    /// Consume the completed snapshot, if one is waiting.
    pub fn take_snapshot(&self) -> Option<Snapshot> {
        self.pending
            .swap(false, Ordering::AcqRel)
            .then(|| *self.snapshot.lock())
    }

    /// Re-enter ready monitoring: armed flag, edge unmasked, converter
    /// selected so its data output signals the next conversion.
    fn arm(&self) {
        self.armed.store(true, Ordering::Release);
        self.line.irq_enable();
        self.line.select();
    }

    /// Quiesce the ready line around a register transaction without
    /// touching the armed flag.
    fn pause(&self) {
        if self.armed.load(Ordering::Acquire) {
            self.line.irq_disable();
            self.line.deselect();
        }
    }

    fn resume(&self) {
        if self.armed.load(Ordering::Acquire) {
            self.line.irq_enable();
            self.line.select();
        }
    }
}

/// Register and pipeline driver for the converter.
pub struct Ad7177<'b, B, L> {
    bus: &'b ControlBus<B>,
    acq: &'b Acquisition<L>,
}

impl<'b, B, L> Ad7177<'b, B, L>
where
    B: SpiBus<u8>,
    L: ReadyLine,
{
    pub fn new(bus: &'b ControlBus<B>, acq: &'b Acquisition<L>) -> Self {
        Self { bus, acq }
    }

    pub fn acquisition(&self) -> &'b Acquisition<L> {
        self.acq
    }

    /// One register transfer: command byte, then `bits / 8` data bytes MSB
    /// first. The ready line is paused for the duration because the data
    /// output toggles during transfers.
    fn transfer(&mut self, read: bool, addr: u8, data: u64, bits: u32) -> Result<u64> {
        if bits % 8 != 0 || bits > 64 || bits == 0 {
            return Err(Error::InvalidArgument);
        }
        let (bus, acq) = (self.bus, self.acq);
        acq.pause();
        let result = bus.with(|spi| {
            acq.line.select();
            let r: Result<u64> = (|| {
                spi.write(&[addr | (u8::from(read) << 6)])?;
                let n = (bits / 8) as usize;
                let tx = data.to_be_bytes();
                let mut rx = [0u8; 8];
                spi.transfer(&mut rx[8 - n..], &tx[8 - n..])?;
                Ok(u64::from_be_bytes(rx))
            })();
            acq.line.deselect();
            r
        });
        acq.resume();
        let value = result?;
        log::trace!("adc xfer: read={read} addr={addr:#04x} bits={bits} -> {value:#x}");
        Ok(value)
    }

    fn write_reg(&mut self, addr: u8, data: u64, bits: u32) -> Result<()> {
        self.transfer(false, addr, data, bits).map(|_| ())
    }

    fn read_reg(&mut self, addr: u8, bits: u32) -> Result<u64> {
        self.transfer(true, addr, 0, bits)
    }

    /// 64 clocks with the data line high return the interface to a known
    /// state.
    pub fn reset(&mut self) -> Result<()> {
        self.transfer(true, 0xFF, u64::MAX, 64).map(|_| ())
    }

    /// Reset the part and load the front-end configuration: select-gated
    /// ready signalling with the status byte appended to data reads,
    /// external reference, slow default rate, channel 0 alone enabled on
    /// the first input pair.
    pub fn init(&mut self) -> Result<()> {
        self.reset()?;
        self.write_reg(reg::IFMODE, 0x0140, 16)?;
        self.write_reg(reg::GPIOCON, 0x0000, 16)?;
        self.write_reg(reg::SETUPCON0, 0x1300, 16)?;
        self.set_rate(SampleRate::Sps5)?;
        self.configure_channel(0, AdcInput::Ain0, AdcInput::Ain1, true)?;
        for ch in 1..ADC_CHANNELS {
            self.configure_channel(ch, AdcInput::Ain0, AdcInput::Ain1, false)?;
        }
        log::info!("adc initialized");
        Ok(())
    }

    pub fn set_rate(&mut self, rate: SampleRate) -> Result<()> {
        self.write_reg(reg::FILTCON0, rate as u64, 16)
    }

    /// Program a channel's input pair and include it in (or drop it from)
    /// the group-completion mask.
    pub fn configure_channel(
        &mut self,
        ch: usize,
        pos: AdcInput,
        neg: AdcInput,
        enabled: bool,
    ) -> Result<()> {
        if ch >= ADC_CHANNELS {
            return Err(Error::InvalidArgument);
        }
        let word = (u64::from(enabled) << 15) | (u64::from(pos as u8) << 5) | u64::from(neg as u8);
        self.write_reg(reg::CHMAP_BASE + ch as u8, word, 16)?;
        let mask = 1u8 << ch;
        let active = self.acq.ch_active.load(Ordering::Relaxed);
        self.acq.ch_active.store(
            if enabled { active | mask } else { active & !mask },
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Arm the pipeline. The conversion already in flight predates the
    /// current configuration, so the next sample is dropped.
    pub fn start(&mut self) {
        self.acq.discard_next.store(true, Ordering::Relaxed);
        self.acq.ch_valid.store(0, Ordering::Relaxed);
        self.acq.active.store(true, Ordering::Release);
        self.acq.arm();
    }

    /// Mask the edge source and deselect the converter.
    pub fn stop(&mut self) {
        self.acq.pause();
        self.acq.active.store(false, Ordering::Release);
        self.acq.armed.store(false, Ordering::Release);
    }

    /// Sampler-task body: read one status+data frame and fold it into the
    /// current group. Returns whether a snapshot was published, in which
    /// case the dispatcher task must be woken.
    pub fn service(&mut self) -> Result<bool> {
        let raw = self.read_reg(reg::DATA, 32)? as u32;
        let sample = raw >> 8;
        let ch = (raw & 0x3) as usize;

        let mut completed = false;
        if self.acq.discard_next.swap(false, Ordering::Relaxed) {
            // Stale conversion captured during reconfiguration.
        } else {
            self.acq.samples[ch].store(sample, Ordering::Relaxed);
            let valid = self.acq.ch_valid.load(Ordering::Relaxed) | (1 << ch);
            let active = self.acq.ch_active.load(Ordering::Relaxed);
            if self.acq.active.load(Ordering::Acquire) && valid & active == active {
                let mut snap = self.acq.snapshot.lock();
                for (slot, value) in snap.samples.iter_mut().zip(&self.acq.samples) {
                    *slot = value.load(Ordering::Relaxed);
                }
                snap.valid = valid;
                drop(snap);
                self.acq.pending.store(true, Ordering::Release);
                self.acq.ch_valid.store(0, Ordering::Relaxed);
                completed = true;
            } else {
                self.acq.ch_valid.store(valid, Ordering::Relaxed);
            }
        }

        if self.acq.active.load(Ordering::Acquire) {
            self.acq.arm();
        }
        Ok(completed)
    }

    /// Dispatcher-task body: hand a completed snapshot to the consumer.
    /// Returns whether one was delivered.
    pub fn dispatch<F: FnMut(&Snapshot)>(&mut self, mut consumer: F) -> bool {
        match self.acq.take_snapshot() {
            Some(snapshot) => {
                consumer(&snapshot);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_bus::{MockReadyLine, MockSpi};

    fn data_frame(sample: u32, ch: u8) -> [u8; 4] {
        [
            (sample >> 16) as u8,
            (sample >> 8) as u8,
            sample as u8,
            ch & 0x3,
        ]
    }

    #[test]
    fn channel_map_word_layout() {
        let bus = ControlBus::new(MockSpi::new());
        let acq = Acquisition::new(MockReadyLine::default());
        let mut adc = Ad7177::new(&bus, &acq);

        adc.configure_channel(1, AdcInput::Ain2, AdcInput::Ain3, true)
            .unwrap();

        bus.with(|spi| {
            // Command byte for register 0x11, then 0x8043: enabled, AIN2+,
            // AIN3-.
            assert_eq!(spi.written.as_slice(), &[0x11, 0x80, 0x43]);
        });
        assert_eq!(acq.ch_active.load(Ordering::Relaxed), 0b0010);

        adc.configure_channel(1, AdcInput::Ain2, AdcInput::Ain3, false)
            .unwrap();
        assert_eq!(acq.ch_active.load(Ordering::Relaxed), 0b0000);
    }

    #[test]
    fn out_of_range_channel_is_rejected() {
        let bus = ControlBus::new(MockSpi::new());
        let acq = Acquisition::new(MockReadyLine::default());
        let mut adc = Ad7177::new(&bus, &acq);

        assert_eq!(
            adc.configure_channel(4, AdcInput::Ain0, AdcInput::Ain1, true),
            Err(Error::InvalidArgument)
        );
        bus.with(|spi| assert!(spi.written.is_empty()));
    }

    #[test]
    fn interrupt_only_fires_while_armed() {
        let acq = Acquisition::new(MockReadyLine::default());
        assert!(!acq.on_data_ready());

        acq.active.store(true, Ordering::Release);
        acq.arm();
        assert!(acq.on_data_ready());
        // Already disarmed: a second edge is spurious.
        assert!(!acq.on_data_ready());
        assert!(!acq.line.irq.load(Ordering::Relaxed));
        assert!(!acq.line.selected.load(Ordering::Relaxed));
    }

    #[test]
    fn group_completes_once_per_active_set() {
        let bus = ControlBus::new(MockSpi::new());
        let acq = Acquisition::new(MockReadyLine::default());
        let mut adc = Ad7177::new(&bus, &acq);

        adc.configure_channel(0, AdcInput::Ain0, AdcInput::Ain1, true)
            .unwrap();
        adc.configure_channel(1, AdcInput::Ain2, AdcInput::Ain3, true)
            .unwrap();
        adc.start();

        bus.with(|spi| {
            spi.script_read(&data_frame(0x00AB_CDEF, 0));
            spi.script_read(&data_frame(0x00AB_CDEF, 0));
            spi.script_read(&data_frame(0x0012_3456, 1));
        });

        // First sample after start is the stale one and gets dropped.
        assert!(acq.on_data_ready());
        assert!(!adc.service().unwrap());
        assert!(acq.take_snapshot().is_none());

        assert!(acq.on_data_ready());
        assert!(!adc.service().unwrap());

        assert!(acq.on_data_ready());
        assert!(adc.service().unwrap());

        let snapshot = acq.take_snapshot().unwrap();
        assert_eq!(snapshot.valid, 0b0011);
        assert_eq!(snapshot.samples[0], 0x00AB_CDEF);
        assert_eq!(snapshot.samples[1], 0x0012_3456);
        // Mask reset for the next group; armed again for the next edge.
        assert_eq!(acq.ch_valid.load(Ordering::Relaxed), 0);
        assert!(acq.armed.load(Ordering::Relaxed));
        assert!(acq.take_snapshot().is_none());
    }

    #[test]
    fn dispatch_invokes_consumer_once() {
        let bus = ControlBus::new(MockSpi::new());
        let acq = Acquisition::new(MockReadyLine::default());
        let mut adc = Ad7177::new(&bus, &acq);

        adc.configure_channel(0, AdcInput::Ain0, AdcInput::Ain1, true)
            .unwrap();
        adc.start();
        acq.discard_next.store(false, Ordering::Relaxed);

        bus.with(|spi| spi.script_read(&data_frame(42, 0)));
        assert!(acq.on_data_ready());
        assert!(adc.service().unwrap());

        let mut seen = 0;
        assert!(adc.dispatch(|snap| {
            seen += 1;
            assert_eq!(snap.valid, 0b0001);
            assert_eq!(snap.samples[0], 42);
        }));
        assert!(!adc.dispatch(|_| seen += 1));
        assert_eq!(seen, 1);
    }

    #[test]
    fn stop_masks_the_line() {
        let bus = ControlBus::new(MockSpi::new());
        let acq = Acquisition::new(MockReadyLine::default());
        let mut adc = Ad7177::new(&bus, &acq);

        adc.start();
        assert!(acq.line.irq.load(Ordering::Relaxed));
        adc.stop();
        assert!(!acq.line.irq.load(Ordering::Relaxed));
        assert!(!acq.active.load(Ordering::Relaxed));
        assert!(!acq.on_data_ready());
    }
}
