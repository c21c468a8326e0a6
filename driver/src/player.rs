//! Media playback: the play/stop state machine and the chunked feed loop.

use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU32;
use vs10xx_pac::SDI_CHUNK_SIZE;

use crate::blob::Blob;
use crate::chipset::Chipset;
use crate::prefs::PrefsStore;
use crate::{Clock, DeviceState, Vs10xx, Vs10xxPeripherals};

/// Upper bound on the time one scheduling tick may spend feeding audio.
/// Streaming shares the cooperative loop with everything else the host does,
/// so the feed yields even when the decoder could take more.
const FEED_BUDGET: MicrosDurationU32 = MicrosDurationU32::from_ticks(30_000);

/// Playback state of the streaming engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum MediaState {
    /// No source is attached.
    Stopped,
    /// A source is attached and playback starts on the next ready tick.
    Starting,
    /// Audio is being fed to the decoder.
    Playing,
    /// Playback is winding down; the decoder gets a soft-reset cycle.
    Stopping,
}

impl MediaState {
    /// Human-readable state name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            MediaState::Stopped => "stopped",
            MediaState::Starting => "starting",
            MediaState::Playing => "playing",
            MediaState::Stopping => "stopping",
        }
    }
}

/// The tick cadence the driver would like from the host scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum TickRate {
    /// Media is active; tick as fast as the scheduler reasonably can.
    Fast,
    /// Idle; a relaxed tick interval is fine.
    Relaxed,
}

/// Audio formats the decoder reports through its header registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum AudioFormat {
    Unknown,
    Wav,
    AacAdts,
    AacAdif,
    AacMp4,
    Mp3,
    Wma,
    Midi,
    Ogg,
}

impl AudioFormat {
    /// Classify the HDAT1 signature word.
    pub(crate) fn from_hdat1(signature: u16) -> Self {
        match signature {
            0x7665 => AudioFormat::Wav,
            0x4154 => AudioFormat::AacAdts,
            0x4144 => AudioFormat::AacAdif,
            0x4D34 => AudioFormat::AacMp4,
            0x574D => AudioFormat::Wma,
            0x4D54 => AudioFormat::Midi,
            0x4F67 => AudioFormat::Ogg,
            0xFFE0..=0xFFFF => AudioFormat::Mp3,
            _ => AudioFormat::Unknown,
        }
    }
}

/// Snapshot of what the decoder is doing, read from its header registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DecoderStatus {
    /// True while the decoder reports an active stream.
    pub playing: bool,
    /// Format of the active stream.
    pub format: AudioFormat,
    /// Seconds decoded since the counter was last cleared.
    pub decode_time_secs: u16,
}

pub(crate) struct Player<'a> {
    pub(crate) state: MediaState,
    pub(crate) current: Option<Blob<'a>>,
    pub(crate) next: Option<Blob<'a>>,
}

impl<'a> Player<'a> {
    pub(crate) fn new() -> Self {
        Player {
            state: MediaState::Stopped,
            current: None,
            next: None,
        }
    }

    /// Drop all sources and return to stopped, e.g. after a device failure.
    pub(crate) fn abort(&mut self) {
        self.state = MediaState::Stopped;
        self.current = None;
        self.next = None;
    }
}

impl<'a, P, C, S> Vs10xx<'a, P, C, S>
where
    P: Vs10xxPeripherals,
    C: Chipset,
    S: PrefsStore,
{
    /// One scheduling pass of the streaming engine. Only called while the
    /// device is ready for use; any transport error fails the device and is
    /// picked up by the next tick.
    pub(crate) fn media_tick(&mut self, delay: &mut impl DelayNs, clock: &mut impl Clock) {
        match self.player.state {
            MediaState::Stopped => {}
            MediaState::Starting => {
                if self.start_playback(delay).is_err() {
                    self.hal.set_failed();
                }
            }
            MediaState::Playing => {
                if self.feed_playback(clock).is_err() {
                    self.hal.set_failed();
                }
            }
            MediaState::Stopping => self.finish_playback(),
        }
    }

    fn start_playback(&mut self, delay: &mut impl DelayNs) -> Result<(), crate::DriverError<P>> {
        if let Some(blob) = self.player.current.as_mut() {
            blob.reset();
        }
        self.hal.clear_decode_time(delay)?;
        self.player.state = MediaState::Playing;
        debug!("media: playing");
        Ok(())
    }

    /// Feed fixed-size chunks while DREQ allows, bounded by [`FEED_BUDGET`].
    /// A pending preference change ends the pass early; the volume write and
    /// the audio share the device and must not starve each other.
    fn feed_playback(&mut self, clock: &mut impl Clock) -> Result<(), crate::DriverError<P>> {
        let started = clock.now();
        loop {
            if self.prefs.has_pending() {
                break;
            }
            if clock.now() - started >= FEED_BUDGET {
                break;
            }
            if !self.hal.is_ready()? {
                continue;
            }

            let Some(blob) = self.player.current.as_mut() else {
                self.player.state = MediaState::Stopping;
                break;
            };
            match blob.next_chunk(SDI_CHUNK_SIZE) {
                Some(chunk) => self.hal.send_data(chunk)?,
                None => {
                    debug!("media: source exhausted");
                    self.player.state = MediaState::Stopping;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Wind down playback. The decoder may still hold abandoned stream data,
    /// so it gets a soft-reset cycle by re-entering verification; a queued
    /// source starts as soon as the device is back up.
    fn finish_playback(&mut self) {
        debug!("media: stopping, cycling the decoder");
        self.player.current = None;
        self.state = DeviceState::Verify;

        if let Some(next) = self.player.next.take() {
            self.player.current = Some(next);
            self.player.state = MediaState::Starting;
        } else {
            self.player.state = MediaState::Stopped;
        }
    }
}
