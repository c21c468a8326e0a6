//! Hardware access layer: register transactions, readiness waits and the
//! verification routines used during bring-up.
//!
//! Every operation here funnels through the pac interface, which drives the
//! control lines and the dual-speed bus. What this layer adds is the DREQ
//! discipline (wait bounded, fail on timeout) and the failure latch: once a
//! transaction has timed out the register state of the device is unknown, so
//! the device is considered failed until the next hard reset.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin as _;
use fugit::MicrosDurationU32;
use vs10xx_pac as pac;

use pac::{addr, sm, SpiSpeed};

use crate::{DriverError, Error, Peripherals, Vs10xxPeripherals};

/// Worst-case DREQ recovery after a routine command, with margin. The
/// datasheet bounds command execution at 22000 XTALI cycles (~1.8 ms at
/// 12.288 MHz).
pub(crate) const READY_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::from_ticks(2_000);

/// Boot takes at most 50000 XTALI cycles (~4 ms); 10 ms leaves slack for
/// slow crystals.
const RESET_READY_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::from_ticks(10_000);

/// Settle time after rewriting the clock configuration.
const CLOCK_SETTLE_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::from_ticks(5_000);

/// Writing 255 to both VOL channels powers down the analog output.
pub(crate) const VOL_POWERDOWN: u16 = 0xFFFF;

/// SCI_AUDATA value for 44.1 kHz stereo output.
const AUDATA_44K1_STEREO: u16 = 44_101;

/// Self-test sweep steps. The slow-speed pass covers the range finely; the
/// fast-speed re-run takes coarse steps.
const SELF_TEST_STEP_SLOW: u16 = 0x0101;
const SELF_TEST_STEP_FAST: u16 = 0x1010;

/// Mismatch count at which the self-test gives up and fails the device.
/// Anything below this is logged and tolerated as bus glitches.
const SELF_TEST_MISMATCH_LIMIT: u8 = 10;

pub(crate) struct Hal<P: Vs10xxPeripherals> {
    device: pac::Vs10xx<pac::Vs10xxInterface<P::Spi, P::Out, P::In>>,
    xrst: Option<P::Out>,
    failed: bool,
}

impl<P: Vs10xxPeripherals> Hal<P> {
    pub(crate) fn new(peripherals: Peripherals<P::Spi, P::Out, P::In>) -> Self {
        let Peripherals {
            spi,
            xcs,
            xdcs,
            dreq,
            xrst,
        } = peripherals;

        Hal {
            device: pac::Vs10xx::new(pac::Vs10xxInterface::new(spi, xcs, xdcs, dreq)),
            xrst,
            failed: false,
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn set_failed(&mut self) {
        self.failed = true;
    }

    pub(crate) fn clear_failed(&mut self) {
        self.failed = false;
    }

    pub(crate) fn is_ready(&mut self) -> Result<bool, DriverError<P>> {
        self.device.is_ready().map_err(Error::Dreq)
    }

    /// Wait for DREQ to rise, polling in 10 us steps. A timeout latches the
    /// failure flag: a command may be half-shifted into the device, so all
    /// subsequent register state is suspect.
    pub(crate) fn wait_for_ready(
        &mut self,
        delay: &mut impl DelayNs,
        max_delay: MicrosDurationU32,
    ) -> Result<(), DriverError<P>> {
        const POLL_STEP_US: u32 = 10;

        let mut remaining_us = max_delay.ticks();
        loop {
            if self.is_ready()? {
                return Ok(());
            }
            if remaining_us == 0 {
                break;
            }
            delay.delay_us(remaining_us.min(POLL_STEP_US));
            remaining_us = remaining_us.saturating_sub(POLL_STEP_US);
        }

        error!("DREQ did not rise within {}us", max_delay.ticks());
        self.failed = true;
        Err(Error::Timeout(max_delay))
    }

    /// Pulse the reset line and wait for the device to boot.
    ///
    /// Without a reset line the device must already be up (DREQ high); a low
    /// DREQ then means the board is wired wrong and nothing we do over SPI
    /// will fix it.
    pub(crate) fn hard_reset(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        self.device.release_lines().map_err(Error::from)?;

        if let Some(xrst) = self.xrst.as_mut() {
            debug!("hard resetting the device");
            xrst.set_low().map_err(Error::Pin)?;
            delay.delay_ms(1);
            xrst.set_high().map_err(Error::Pin)?;
            self.wait_for_ready(delay, RESET_READY_TIMEOUT)?;
            // A hard reset may well have cured whatever failed before.
            self.failed = false;
        } else {
            if !self.is_ready()? {
                error!("DREQ is low and no reset line is wired; did the device boot at all?");
                self.failed = true;
                return Err(Error::NotWired);
            }
            warn!("no reset line wired, skipping hard reset");
        }

        // The device boots at the 1.0x clock multiplier and can only follow
        // a slow SPI clock.
        self.device.set_speed(SpiSpeed::Slow);
        Ok(())
    }

    /// Soft reset into native mode and verify the mode register took exactly
    /// the expected value.
    pub(crate) fn soft_reset(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        debug!("soft resetting the device");
        self.wait_for_ready(delay, READY_TIMEOUT)?;
        self.device
            .mode()
            .write(|r| {
                r.set_sdi_new(true);
                r.set_reset(true);
            })
            .map_err(Error::from)?;
        self.wait_for_ready(delay, READY_TIMEOUT)?;

        let mode = self.read_register(addr::MODE, delay)?;
        if mode != sm::SM_SDINEW {
            error!("SCI_MODE readback after soft reset is {:#x}, expected SM_SDINEW", mode);
            self.failed = true;
            return Err(Error::UnexpectedMode { found: mode });
        }
        Ok(())
    }

    /// Drop the device clock to the power-on multiplier and slow the bus to
    /// match.
    pub(crate) fn go_slow(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        debug!("configuring the device for slow SPI");
        self.write_register(addr::CLOCKF, 0x0000, delay)?;
        self.device.set_speed(SpiSpeed::Slow);
        Ok(())
    }

    /// Install the chip-specific clock multiplier and speed the bus up.
    pub(crate) fn go_fast(
        &mut self,
        clockf: u16,
        delay: &mut impl DelayNs,
    ) -> Result<(), DriverError<P>> {
        debug!("configuring the device for fast SPI (CLOCKF {:#x})", clockf);
        self.write_register(addr::CLOCKF, clockf, delay)?;
        self.device.set_speed(SpiSpeed::Fast);
        self.wait_for_ready(delay, CLOCK_SETTLE_TIMEOUT)
    }

    /// Sweep write/read cycles over the volume register to prove the bus is
    /// sound at the current speed. Every value must round-trip on two
    /// consecutive reads; isolated glitches are logged and tolerated up to
    /// [`SELF_TEST_MISMATCH_LIMIT`].
    pub(crate) fn self_test(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        self.wait_for_ready(delay, READY_TIMEOUT)?;

        let step = match self.device.speed() {
            SpiSpeed::Slow => SELF_TEST_STEP_SLOW,
            SpiSpeed::Fast => SELF_TEST_STEP_FAST,
        };

        let mut cycles: u32 = 0;
        let mut mismatches: u8 = 0;
        let mut value: u32 = 0;
        while value < 0xFFFF {
            cycles += 1;
            let written = value as u16;
            self.write_register(addr::VOL, written, delay)?;
            let read1 = self.read_register(addr::VOL, delay)?;
            let read2 = self.read_register(addr::VOL, delay)?;
            if read1 != written || read2 != written {
                mismatches += 1;
                error!(
                    "bus test mismatch after {} cycles; wrote {:#x}, read back {:#x} and {:#x}",
                    cycles, written, read1, read2
                );
                if mismatches == SELF_TEST_MISMATCH_LIMIT {
                    break;
                }
            }
            value += u32::from(step);
        }

        if mismatches >= SELF_TEST_MISMATCH_LIMIT {
            self.failed = true;
            return Err(Error::SelfTest { mismatches });
        }
        debug!("bus test passed over {} write/read cycles", cycles);
        Ok(())
    }

    /// Read the chip identity nibble from the status register and compare it
    /// with what the configured chipset policy expects.
    pub(crate) fn verify_chipset(
        &mut self,
        expected: u8,
        name: &str,
        delay: &mut impl DelayNs,
    ) -> Result<(), DriverError<P>> {
        let status = self.read_register(addr::STATUS, delay)?;
        let version = ((status >> 4) & 0x0F) as u8;

        if version != expected {
            error!(
                "unsupported chipset version {} (expected {} for {})",
                version, expected, name
            );
            self.failed = true;
            return Err(Error::WrongChipset {
                found: version,
                expected,
            });
        }
        debug!("chipset version {} verified OK", version);
        Ok(())
    }

    /// Power down the analog output.
    pub(crate) fn mute_output(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        debug!("powering down the analog output");
        self.write_register(addr::VOL, VOL_POWERDOWN, delay)?;
        self.wait_for_ready(delay, READY_TIMEOUT)
    }

    /// Configure the output for 44.1 kHz stereo.
    pub(crate) fn start_audio(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        debug!("enabling analog audio at 44.1 kHz stereo");
        self.write_register(addr::AUDATA, AUDATA_44K1_STEREO, delay)?;
        self.wait_for_ready(delay, READY_TIMEOUT)
    }

    /// Clear the decode-time counter. The register latches a new value only
    /// when it is written twice.
    pub(crate) fn clear_decode_time(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<(), DriverError<P>> {
        debug!("clearing the decode time counter");
        self.write_register(addr::DECODE_TIME, 0, delay)?;
        self.write_register(addr::DECODE_TIME, 0, delay)
    }

    /// Complete register write: wait for DREQ, then run the SCI transaction.
    pub(crate) fn write_register(
        &mut self,
        reg: u8,
        value: u16,
        delay: &mut impl DelayNs,
    ) -> Result<(), DriverError<P>> {
        self.wait_for_ready(delay, READY_TIMEOUT)?;
        self.device.write_raw(reg, value).map_err(Error::from)?;
        trace!("write_register {:#x} <- {:#x}", reg, value);
        Ok(())
    }

    /// Complete register read: wait for DREQ, then run the SCI transaction.
    pub(crate) fn read_register(
        &mut self,
        reg: u8,
        delay: &mut impl DelayNs,
    ) -> Result<u16, DriverError<P>> {
        self.wait_for_ready(delay, READY_TIMEOUT)?;
        let value = self.device.read_raw(reg).map_err(Error::from)?;
        trace!("read_register {:#x} -> {:#x}", reg, value);
        Ok(value)
    }

    /// Stream one data chunk over SDI. The caller is responsible for having
    /// checked DREQ; a low DREQ here is an error, not a wait.
    pub(crate) fn send_data(&mut self, chunk: &[u8]) -> Result<(), DriverError<P>> {
        self.device.send_data(chunk).map_err(Error::from)
    }
}
