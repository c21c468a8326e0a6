//! A fake VS10XX chip for driving the public driver API in tests.
//!
//! The fake implements the HAL traits over a shared register file and
//! interprets the SCI byte protocol the same way the real chip does: opcode
//! 2 stores a value, opcode 3 arms a readback, XDCS-selected writes are
//! captured as streamed audio. Tests inject faults by tweaking the shared
//! state (DREQ stuck low, corrupted readbacks, wrong identity, ...).

#![allow(dead_code)]

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::{ErrorType as DigitalErrorType, InputPin, OutputPin};
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};
use embedded_hal_mock::eh1::delay::NoopDelay;

use vs10xx_driver::pac::{addr, sm, DualSpeedSpi, SpiSpeed};
use vs10xx_driver::{
    AudioPrefs, Clock, DeviceState, Instant, Peripherals, Plugin, PrefsStore, Vs1003, Vs10xx,
};

/// STATUS word reporting the VS1003 identity nibble.
pub const STATUS_VS1003: u16 = 3 << 4;
/// STATUS word reporting the VS1053 identity nibble.
pub const STATUS_VS1053: u16 = 4 << 4;

/// One observable bus interaction, in order of occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An SCI register write (address, value).
    Sci(u8, u16),
    /// An SDI data chunk of the given length.
    Sdi(usize),
}

pub struct ChipState {
    pub regs: [u16; 16],
    pub dreq: bool,
    /// What DREQ does once the reset line is released.
    pub dreq_after_reset: bool,
    pub xcs_high: bool,
    pub xdcs_high: bool,
    pub pending_read: Option<u8>,
    pub speed: SpiSpeed,
    /// Value MODE settles to after a soft reset is requested.
    pub mode_after_reset: u16,
    /// Value STATUS reports after boot.
    pub status_value: u16,
    /// Corrupt this many upcoming VOL readbacks (bit-flipped low byte).
    pub corrupt_vol_reads: usize,
    pub events: Vec<Event>,
    pub sdi: Vec<u8>,
}

impl ChipState {
    fn new() -> Self {
        let mut state = ChipState {
            regs: [0; 16],
            dreq: true,
            dreq_after_reset: true,
            xcs_high: true,
            xdcs_high: true,
            pending_read: None,
            speed: SpiSpeed::Slow,
            mode_after_reset: sm::SM_SDINEW,
            status_value: STATUS_VS1003,
            corrupt_vol_reads: 0,
            events: Vec::new(),
            sdi: Vec::new(),
        };
        state.boot();
        state
    }

    fn boot(&mut self) {
        self.regs = [0; 16];
        self.regs[usize::from(addr::MODE)] = sm::SM_SDINEW;
        self.regs[usize::from(addr::STATUS)] = self.status_value;
    }

    fn command_write(&mut self, reg: u8, value: u16) {
        self.events.push(Event::Sci(reg, value));
        if reg == addr::MODE && value & sm::SM_RESET != 0 {
            self.regs[usize::from(addr::MODE)] = self.mode_after_reset;
        } else {
            self.regs[usize::from(reg) & 0xF] = value;
        }
    }

    /// All SCI writes seen so far, in order.
    pub fn sci_writes(&self) -> Vec<(u8, u16)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Sci(reg, value) => Some((*reg, *value)),
                Event::Sdi(_) => None,
            })
            .collect()
    }

    /// All values written to one register, in order.
    pub fn writes_to(&self, reg: u8) -> Vec<u16> {
        self.sci_writes()
            .into_iter()
            .filter_map(|(r, v)| (r == reg).then_some(v))
            .collect()
    }

    pub fn last_write_to(&self, reg: u8) -> Option<u16> {
        self.writes_to(reg).last().copied()
    }

    /// Lengths of the SDI chunks streamed so far, in order.
    pub fn sdi_chunks(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Sdi(len) => Some(*len),
                Event::Sci(..) => None,
            })
            .collect()
    }
}

pub fn chip() -> Rc<RefCell<ChipState>> {
    Rc::new(RefCell::new(ChipState::new()))
}

#[derive(Clone)]
pub struct FakeSpi(pub Rc<RefCell<ChipState>>);

impl SpiErrorType for FakeSpi {
    type Error = Infallible;
}

impl SpiBus<u8> for FakeSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        let reg = state
            .pending_read
            .take()
            .expect("SPI read with no read command armed");
        let mut value = state.regs[usize::from(reg) & 0xF];
        if reg == addr::VOL && state.corrupt_vol_reads > 0 {
            state.corrupt_vol_reads -= 1;
            value ^= 0x00FF;
        }
        assert_eq!(words.len(), 2, "register reads are two bytes");
        words.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        let mut state = self.0.borrow_mut();
        if !state.xcs_high {
            match (words.first().copied(), words.len()) {
                (Some(2), 4) => {
                    let value = u16::from_be_bytes([words[2], words[3]]);
                    state.command_write(words[1], value);
                }
                (Some(3), 2) => state.pending_read = Some(words[1]),
                _ => panic!("malformed SCI frame: {words:?}"),
            }
        } else if !state.xdcs_high {
            state.sdi.extend_from_slice(words);
            state.events.push(Event::Sdi(words.len()));
        } else {
            panic!("SPI write with neither XCS nor XDCS asserted");
        }
        Ok(())
    }

    fn transfer(&mut self, _read: &mut [u8], _write: &[u8]) -> Result<(), Infallible> {
        unimplemented!("the driver only uses write and read")
    }

    fn transfer_in_place(&mut self, _words: &mut [u8]) -> Result<(), Infallible> {
        unimplemented!("the driver only uses write and read")
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl DualSpeedSpi for FakeSpi {
    fn set_speed(&mut self, speed: SpiSpeed) {
        self.0.borrow_mut().speed = speed;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Line {
    Xcs,
    Xdcs,
    Xrst,
}

#[derive(Clone)]
pub struct FakePin {
    pub line: Line,
    pub state: Rc<RefCell<ChipState>>,
}

impl DigitalErrorType for FakePin {
    type Error = Infallible;
}

impl OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.apply(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.apply(true);
        Ok(())
    }
}

impl FakePin {
    fn apply(&mut self, high: bool) {
        let mut state = self.state.borrow_mut();
        match self.line {
            Line::Xcs => state.xcs_high = high,
            Line::Xdcs => state.xdcs_high = high,
            Line::Xrst => {
                if high {
                    // Releasing reset boots the chip.
                    state.dreq = state.dreq_after_reset;
                    state.boot();
                } else {
                    state.dreq = false;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct FakeDreq(pub Rc<RefCell<ChipState>>);

impl DigitalErrorType for FakeDreq {
    type Error = Infallible;
}

impl InputPin for FakeDreq {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.borrow().dreq)
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0.borrow().dreq)
    }
}

/// Monotonic fake clock advancing a fixed step per reading.
pub struct FakeClock {
    now: u32,
    pub step: u32,
}

impl FakeClock {
    pub fn with_step(step: u32) -> Self {
        FakeClock { now: 0, step }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        FakeClock::with_step(100)
    }
}

impl Clock for FakeClock {
    fn now(&mut self) -> Instant {
        self.now = self.now.wrapping_add(self.step);
        Instant::from_ticks(self.now)
    }
}

pub struct MemStore {
    pub initial: Option<AudioPrefs>,
    pub saved: Rc<RefCell<Vec<AudioPrefs>>>,
}

impl PrefsStore for MemStore {
    fn load(&mut self) -> Option<AudioPrefs> {
        self.initial
    }

    fn save(&mut self, prefs: &AudioPrefs) {
        self.saved.borrow_mut().push(*prefs);
    }
}

pub type TestPeripherals = Peripherals<FakeSpi, FakePin, FakeDreq>;
pub type TestDriver = Vs10xx<'static, TestPeripherals, Vs1003, MemStore>;

pub struct Bench {
    pub driver: TestDriver,
    pub chip: Rc<RefCell<ChipState>>,
    pub saved: Rc<RefCell<Vec<AudioPrefs>>>,
}

pub fn bench() -> Bench {
    bench_with(BenchConfig::default())
}

#[derive(Default)]
pub struct BenchConfig {
    pub initial_prefs: Option<AudioPrefs>,
    pub plugins: &'static [Plugin<'static>],
    pub without_reset_line: bool,
}

pub fn bench_with(config: BenchConfig) -> Bench {
    let chip = chip();
    let saved = Rc::new(RefCell::new(Vec::new()));

    let peripherals = Peripherals {
        spi: FakeSpi(chip.clone()),
        xcs: FakePin {
            line: Line::Xcs,
            state: chip.clone(),
        },
        xdcs: FakePin {
            line: Line::Xdcs,
            state: chip.clone(),
        },
        dreq: FakeDreq(chip.clone()),
        xrst: (!config.without_reset_line).then(|| FakePin {
            line: Line::Xrst,
            state: chip.clone(),
        }),
    };

    let driver = Vs10xx::new(
        peripherals,
        Vs1003,
        config.plugins,
        MemStore {
            initial: config.initial_prefs,
            saved: saved.clone(),
        },
    );

    Bench {
        driver,
        chip,
        saved,
    }
}

impl Bench {
    /// Run `n` scheduling ticks with a noop delay and the default clock.
    pub fn ticks(&mut self, n: usize) {
        let mut clock = FakeClock::default();
        for _ in 0..n {
            self.driver.tick(&mut NoopDelay, &mut clock);
        }
    }

    /// Run bring-up to completion and assert it reached the ready state.
    pub fn bring_up(&mut self) {
        self.ticks(6);
        assert_eq!(self.driver.device_state(), DeviceState::Ready);
    }
}
