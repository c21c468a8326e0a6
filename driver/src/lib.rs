#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

//! Driver for the VS10XX family of SPI audio decoder chips.
//!
//! The driver owns the whole life of the device: it brings the chip from an
//! unknown power-on state through reset, bus verification, clock upgrade and
//! plugin loading into a verified ready state, then streams audio to it with
//! flow control and keeps user preferences (volume, mute) in sync across
//! resets.
//!
//! Everything runs cooperatively from a single periodically invoked
//! [`Vs10xx::tick`]. One tick performs at most one bring-up step, or - once
//! the device is ready - one bounded pass of preference sync and audio
//! feeding. The only blocking inside a tick is short bounded waits on the
//! DREQ line. Failures are not panics and not errors thrown at the caller:
//! they transition the device into a terminal failed state that rejects
//! further commands until [`Vs10xx::restart`].
//!
//! ```ignore
//! let mut dev = Vs10xx::new(peripherals, Vs1053, &[], store);
//! loop {
//!     dev.tick(&mut delay, &mut clock);
//!     if dev.device_state() == DeviceState::Ready && !queued {
//!         dev.play(Blob::new(TRACK));
//!         queued = true;
//!     }
//! }
//! ```

pub use vs10xx_pac as pac;

#[macro_use]
mod fmt;

mod blob;
mod chipset;
mod hal;
mod player;
mod plugin;
mod prefs;

pub use blob::Blob;
pub use chipset::{Chipset, Vs1003, Vs1053};
pub use player::{AudioFormat, DecoderStatus, MediaState, TickRate};
pub use plugin::{Plugin, PluginFormatError};
pub use prefs::{volume_from_device, volume_to_device, AudioPrefs, PrefsStore, VOLUME_MAX};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use pac::{addr, DualSpeedSpi};

use hal::Hal;
use player::Player;
use prefs::Preferences;

/// Timestamp of the monotonic microsecond clock, see [`Clock`].
pub type Instant = fugit::TimerInstantU32<1_000_000>;

/// A monotonic microsecond clock, used to bound the per-tick feed budget.
pub trait Clock {
    /// The current timestamp. Must never move backwards between calls.
    fn now(&mut self) -> Instant;
}

/// Contains all peripherals required to interface with a VS10XX chip.
///
/// XCS and XDCS select the command and data interfaces and must be dedicated
/// push-pull outputs. DREQ is the chip's ready signal. The reset line is
/// optional; without it the chip must be wired to boot on its own, and a
/// failed device can only be recovered by power-cycling the board.
#[derive(Debug)]
pub struct Peripherals<TSpi, TOut, TIn> {
    /// The shared SPI bus, switchable between the slow and fast rate.
    pub spi: TSpi,
    /// Command interface select, active low.
    pub xcs: TOut,
    /// Data interface select, active low.
    pub xdcs: TOut,
    /// The DREQ input pin.
    pub dreq: TIn,
    /// The XRST output pin, if wired.
    pub xrst: Option<TOut>,
}

/// Helper trait to represent device peripherals.
///
/// This is used in the implementation to reduce the number of generic
/// arguments everywhere.
pub trait Vs10xxPeripherals {
    /// The type of the dual-speed SPI bus.
    type Spi: DualSpeedSpi;
    /// The type of the XCS/XDCS/XRST output pins.
    type Out: OutputPin;
    /// The type of the DREQ input pin.
    type In: InputPin;

    /// Return the peripheral instances.
    fn take(self) -> Peripherals<Self::Spi, Self::Out, Self::In>;
}

impl<TSpi, TOut, TIn> Vs10xxPeripherals for Peripherals<TSpi, TOut, TIn>
where
    TSpi: DualSpeedSpi,
    TOut: OutputPin,
    TIn: InputPin,
{
    type Spi = TSpi;
    type Out = TOut;
    type In = TIn;

    fn take(self) -> Self {
        self
    }
}

/// SPI bus error type of a peripheral set.
pub type SpiError<P> = <<P as Vs10xxPeripherals>::Spi as embedded_hal::spi::ErrorType>::Error;
/// Output pin error type of a peripheral set.
pub type PinError<P> = <<P as Vs10xxPeripherals>::Out as embedded_hal::digital::ErrorType>::Error;
/// DREQ pin error type of a peripheral set.
pub type DreqError<P> = <<P as Vs10xxPeripherals>::In as embedded_hal::digital::ErrorType>::Error;
/// The concrete [`Error`] type produced with a peripheral set `P`.
pub type DriverError<P> = Error<SpiError<P>, PinError<P>, DreqError<P>>;

/// The error enum produced by the transport and bring-up operations.
///
/// These errors stay inside the driver: the tick translates them into the
/// failed device state, and the public command surface reports rejections
/// with [`CommandError`] instead.
#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error<ESpi, EOut, EIn> {
    /// An SPI transfer failed.
    #[error("SPI transfer failed")]
    Spi(ESpi),

    /// Driving a control or reset line failed.
    #[error("control line write failed")]
    Pin(EOut),

    /// Reading the DREQ pin failed.
    #[error("DREQ read failed")]
    Dreq(EIn),

    /// A transaction was attempted while DREQ was low.
    #[error("device is busy (DREQ is low)")]
    Busy,

    /// DREQ did not rise within the bounded wait.
    #[error("DREQ did not rise within {}us", .0.ticks())]
    Timeout(fugit::MicrosDurationU32),

    /// DREQ is low at power-on and there is no reset line to pulse.
    #[error("DREQ is low and no reset line is wired")]
    NotWired,

    /// The mode register did not read back as expected after a soft reset.
    #[error("mode register readback was {found:#06x} after soft reset")]
    UnexpectedMode {
        /// The observed register value.
        found: u16,
    },

    /// The chip identity does not match the configured chipset policy.
    #[error("unsupported chipset version {found} (expected {expected})")]
    WrongChipset {
        /// The version nibble the chip reported.
        found: u8,
        /// The version nibble the policy expects.
        expected: u8,
    },

    /// The communication self-test saw too many mismatches.
    #[error("bus self-test failed with {mismatches} mismatches")]
    SelfTest {
        /// Mismatched write/read cycles observed before giving up.
        mismatches: u8,
    },

    /// A plugin image is structurally invalid.
    #[error("malformed plugin image")]
    Plugin(#[source] PluginFormatError),
}

impl<ESpi, EOut, EIn> From<pac::Vs10xxInterfaceError<ESpi, EOut, EIn>> for Error<ESpi, EOut, EIn> {
    fn from(value: pac::Vs10xxInterfaceError<ESpi, EOut, EIn>) -> Self {
        match value {
            pac::Vs10xxInterfaceError::Spi(err) => Self::Spi(err),
            pac::Vs10xxInterfaceError::Pin(err) => Self::Pin(err),
            pac::Vs10xxInterfaceError::Dreq(err) => Self::Dreq(err),
            pac::Vs10xxInterfaceError::Busy => Self::Busy,
        }
    }
}

impl<ESpi, EOut, EIn> From<PluginFormatError> for Error<ESpi, EOut, EIn> {
    fn from(value: PluginFormatError) -> Self {
        Self::Plugin(value)
    }
}

/// Why a public command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum CommandError {
    /// The device has not finished bring-up yet.
    #[error("the device is not ready for use")]
    DeviceNotReady,
    /// The device is in the failed state and needs a restart.
    #[error("the device has failed and must be restarted")]
    DeviceFailed,
}

/// Bring-up and operational state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DeviceState {
    /// Waiting for / performing the hardware reset.
    Reset,
    /// Verifying communication and chip identity at slow bus speed.
    Verify,
    /// Upgrading the device clock and re-verifying at fast bus speed.
    Upgrade,
    /// Applying registered firmware plugins.
    LoadPlugins,
    /// Configuring the analog output and restoring preferences.
    InitAudio,
    /// Verified and usable.
    Ready,
    /// A failure was detected and is about to be reported.
    ReportFailed,
    /// Terminal failure; only [`Vs10xx::restart`] leaves this state.
    Failed,
}

impl DeviceState {
    /// Human-readable state name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceState::Reset => "reset",
            DeviceState::Verify => "verify",
            DeviceState::Upgrade => "upgrade",
            DeviceState::LoadPlugins => "load-plugins",
            DeviceState::InitAudio => "init-audio",
            DeviceState::Ready => "ready",
            DeviceState::ReportFailed => "report-failed",
            DeviceState::Failed => "failed",
        }
    }
}

/// High level interface for a VS10XX audio decoder.
///
/// Generic over the peripheral set `P`, the chipset policy `C` selecting the
/// family member, and the preference store `S`.
pub struct Vs10xx<'a, P: Vs10xxPeripherals, C, S> {
    pub(crate) hal: Hal<P>,
    chipset: C,
    plugins: &'a [Plugin<'a>],
    pub(crate) state: DeviceState,
    pub(crate) player: Player<'a>,
    pub(crate) prefs: Preferences<S>,
}

impl<P: Vs10xxPeripherals, C, S> core::fmt::Debug for Vs10xx<'_, P, C, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vs10xx")
            .field("state", &self.state)
            .field("media", &self.player.state)
            .finish_non_exhaustive()
    }
}

impl<'a, P, C, S> Vs10xx<'a, P, C, S>
where
    P: Vs10xxPeripherals,
    C: Chipset,
    S: PrefsStore,
{
    /// Create the driver. Nothing touches the hardware until the first
    /// [`tick`](Self::tick); preferences are loaded from `store` right away.
    pub fn new(peripherals: P, chipset: C, plugins: &'a [Plugin<'a>], store: S) -> Self {
        Vs10xx {
            hal: Hal::new(peripherals.take()),
            chipset,
            plugins,
            state: DeviceState::Reset,
            player: Player::new(),
            prefs: Preferences::new(store),
        }
    }

    /// One pass of the cooperative scheduling loop.
    ///
    /// Performs at most one bring-up step, or - in the ready state - one
    /// preference sync attempt followed by one bounded media pass. Never
    /// blocks beyond the short DREQ waits and the feed budget.
    pub fn tick(&mut self, delay: &mut impl DelayNs, clock: &mut impl Clock) {
        if self.hal.has_failed()
            && !matches!(self.state, DeviceState::ReportFailed | DeviceState::Failed)
        {
            self.state = DeviceState::ReportFailed;
        }

        match self.state {
            DeviceState::Reset => {
                if self.hal.hard_reset(delay).is_ok() {
                    self.state = DeviceState::Verify;
                } else {
                    self.hal.set_failed();
                }
            }
            DeviceState::Verify => {
                if self.verify_phase(delay).is_ok() {
                    self.state = DeviceState::Upgrade;
                } else {
                    self.hal.set_failed();
                }
            }
            DeviceState::Upgrade => {
                if self.upgrade_phase(delay).is_ok() {
                    self.state = DeviceState::LoadPlugins;
                } else {
                    self.hal.set_failed();
                }
            }
            DeviceState::LoadPlugins => {
                if self.load_plugins_phase(delay).is_ok() {
                    self.state = DeviceState::InitAudio;
                } else {
                    self.hal.set_failed();
                }
            }
            DeviceState::InitAudio => {
                if self.init_audio_phase(delay).is_ok() {
                    info!("device initialized successfully");
                    self.state = DeviceState::Ready;
                } else {
                    self.hal.set_failed();
                }
            }
            DeviceState::Ready => {
                if self.prefs.sync(&mut self.hal, delay).is_err() {
                    self.hal.set_failed();
                    return;
                }
                self.media_tick(delay, clock);
            }
            DeviceState::ReportFailed => {
                error!("device failed; stopping all playback");
                self.player.abort();
                self.state = DeviceState::Failed;
            }
            DeviceState::Failed => {}
        }
    }

    fn verify_phase(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        self.hal.go_slow(delay)?;
        self.hal.self_test(delay)?;
        self.hal.soft_reset(delay)?;
        self.hal
            .verify_chipset(self.chipset.version(), self.chipset.name(), delay)
    }

    fn upgrade_phase(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        self.hal.go_fast(self.chipset.fast_clockf(), delay)?;
        self.hal.self_test(delay)
    }

    fn load_plugins_phase(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        for plugin in self.plugins {
            debug!("loading plugin: {}", plugin.description());
            plugin.load(&mut self.hal, delay)?;
        }
        Ok(())
    }

    fn init_audio_phase(&mut self, delay: &mut impl DelayNs) -> Result<(), DriverError<P>> {
        self.hal.mute_output(delay)?;
        self.hal.start_audio(delay)?;
        self.prefs.mark_all_dirty();
        self.prefs.sync(&mut self.hal, delay)
    }

    /// Request playback of `blob`.
    ///
    /// Only accepted while the device is ready. When something is already
    /// playing, the current source is abandoned, the decoder gets a reset
    /// cycle and `blob` starts afterwards; two rapid calls never interleave
    /// their sources.
    pub fn play(&mut self, blob: Blob<'a>) -> Result<(), CommandError> {
        self.reject_unless_ready()?;

        match self.player.state {
            MediaState::Stopped => {
                debug!("play: starting media");
                self.player.current = Some(blob);
                self.player.state = MediaState::Starting;
            }
            MediaState::Starting => {
                // Nothing has been fed yet, just swap the source.
                self.player.current = Some(blob);
            }
            MediaState::Playing => {
                debug!("play: already playing, queueing source after stop");
                self.player.next = Some(blob);
                self.player.state = MediaState::Stopping;
            }
            MediaState::Stopping => {
                self.player.next = Some(blob);
            }
        }
        Ok(())
    }

    /// Stop playback. Idempotent; takes effect at the next chunk boundary.
    pub fn stop(&mut self) {
        match self.player.state {
            MediaState::Playing => {
                debug!("stop: stopping media");
                self.player.state = MediaState::Stopping;
            }
            MediaState::Starting => {
                // Nothing was fed yet, no need to cycle the decoder.
                self.player.current = None;
                self.player.state = MediaState::Stopped;
            }
            MediaState::Stopping | MediaState::Stopped => {}
        }
    }

    /// Set both channel volumes on the external 0..=30 scale. Out-of-range
    /// values are clamped. Persisted immediately, written to the device on
    /// the next ready tick.
    pub fn set_volume(&mut self, left: u8, right: u8) -> Result<(), CommandError> {
        self.reject_if_failed()?;
        self.prefs.set_volume(left, right);
        Ok(())
    }

    /// Adjust both channel volumes by `delta`, saturating at the scale ends.
    pub fn change_volume(&mut self, delta: i8) -> Result<(), CommandError> {
        self.reject_if_failed()?;
        self.prefs.change_volume(delta);
        Ok(())
    }

    /// Mute or unmute the analog output.
    pub fn set_muted(&mut self, muted: bool) -> Result<(), CommandError> {
        self.reject_if_failed()?;
        self.prefs.set_muted(muted);
        Ok(())
    }

    /// The current preference record.
    pub fn prefs(&self) -> &AudioPrefs {
        self.prefs.get()
    }

    /// The current bring-up state.
    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    /// The current playback state.
    pub fn media_state(&self) -> MediaState {
        self.player.state
    }

    /// True once the device has entered (or is about to enter) the terminal
    /// failed state.
    pub fn has_failed(&self) -> bool {
        self.hal.has_failed()
            || matches!(self.state, DeviceState::ReportFailed | DeviceState::Failed)
    }

    /// The tick cadence the driver currently wants from the host scheduler.
    pub fn tick_rate(&self) -> TickRate {
        match self.player.state {
            MediaState::Stopped => TickRate::Relaxed,
            _ => TickRate::Fast,
        }
    }

    /// Re-enter bring-up from the hardware reset, clearing the failure
    /// latch. This is the host-driven recovery path out of
    /// [`DeviceState::Failed`].
    pub fn restart(&mut self) {
        info!("restart requested, re-entering bring-up");
        self.hal.clear_failed();
        self.player.abort();
        self.state = DeviceState::Reset;
    }

    /// Read what the decoder reports about the current stream.
    ///
    /// Meaningful while the device is ready; in other states the probe may
    /// fail or return stale values.
    pub fn decoder_status(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<DecoderStatus, DriverError<P>> {
        let hdat0 = self.hal.read_register(addr::HDAT0, delay)?;
        let hdat1 = self.hal.read_register(addr::HDAT1, delay)?;
        let decode_time_secs = self.hal.read_register(addr::DECODE_TIME, delay)?;

        let playing = !(hdat0 == 0 && hdat1 == 0);
        Ok(DecoderStatus {
            playing,
            format: if playing {
                AudioFormat::from_hdat1(hdat1)
            } else {
                AudioFormat::Unknown
            },
            decode_time_secs,
        })
    }

    /// Log the driver configuration: chipset policy and registered plugins.
    pub fn log_config(&self) {
        info!("VS10XX driver, chipset policy: {}", self.chipset.name());
        for plugin in self.plugins {
            info!("  plugin: {}", plugin.description());
        }
    }

    fn reject_if_failed(&self) -> Result<(), CommandError> {
        if self.has_failed() {
            warn!("command rejected: the device has failed");
            return Err(CommandError::DeviceFailed);
        }
        Ok(())
    }

    fn reject_unless_ready(&self) -> Result<(), CommandError> {
        self.reject_if_failed()?;
        if self.state != DeviceState::Ready {
            warn!("command rejected: the device is not ready");
            return Err(CommandError::DeviceNotReady);
        }
        Ok(())
    }
}
