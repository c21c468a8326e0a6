//! User-facing audio preferences and their synchronization with the device.
//!
//! Preferences live in three places: the local record here, the host's
//! persistent store, and the SCI_VOL register. Setters update the record and
//! persist right away, but the register write is deferred to the next
//! scheduling tick in which the device is ready, tracked by per-field dirty
//! bits. Volume uses an external 0..=30 scale that is mapped to the chip's
//! 0..=254 attenuation encoding.

use embedded_hal::delay::DelayNs;
use vs10xx_pac::addr;

use crate::hal::{Hal, VOL_POWERDOWN};
use crate::{DriverError, Vs10xxPeripherals};

/// Loudest external volume level; 0 is silent.
pub const VOLUME_MAX: u8 = 30;

/// The persisted preference record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AudioPrefs {
    /// Left channel volume, 0..=30.
    pub left: u8,
    /// Right channel volume, 0..=30.
    pub right: u8,
    /// Whether the analog output is powered down.
    pub muted: bool,
}

impl Default for AudioPrefs {
    fn default() -> Self {
        AudioPrefs {
            left: VOLUME_MAX,
            right: VOLUME_MAX,
            muted: false,
        }
    }
}

impl AudioPrefs {
    fn clamped(self) -> Self {
        AudioPrefs {
            left: self.left.min(VOLUME_MAX),
            right: self.right.min(VOLUME_MAX),
            muted: self.muted,
        }
    }
}

/// Persistent storage for the preference record.
///
/// `save` is fire-and-forget; a store that cannot persist should log and
/// carry on rather than error, since persistence is best-effort by design.
pub trait PrefsStore {
    /// Load the stored record, or `None` when nothing (valid) is stored.
    fn load(&mut self) -> Option<AudioPrefs>;

    /// Persist the record.
    fn save(&mut self, prefs: &AudioPrefs);
}

/// Map an external 0..=30 level to the device's inverted 0..=254
/// attenuation scale.
pub fn volume_to_device(external: u8) -> u8 {
    let v = u32::from(external.min(VOLUME_MAX));
    (((u32::from(VOLUME_MAX) - v) * 254 + 15) / 30) as u8
}

/// Inverse of [`volume_to_device`], exact for all lattice points 0..=30.
pub fn volume_from_device(device: u8) -> u8 {
    let d = u32::from(device.min(254));
    VOLUME_MAX - ((d * 30 + 127) / 254) as u8
}

pub(crate) struct Preferences<S> {
    store: S,
    current: AudioPrefs,
    dirty_volume: bool,
    dirty_mute: bool,
}

impl<S: PrefsStore> Preferences<S> {
    pub(crate) fn new(mut store: S) -> Self {
        let current = match store.load() {
            Some(prefs) => prefs.clamped(),
            None => {
                warn!("no stored audio preferences, falling back to defaults");
                AudioPrefs::default()
            }
        };
        Preferences {
            store,
            current,
            dirty_volume: false,
            dirty_mute: false,
        }
    }

    pub(crate) fn get(&self) -> &AudioPrefs {
        &self.current
    }

    pub(crate) fn set_volume(&mut self, left: u8, right: u8) {
        self.current.left = left.min(VOLUME_MAX);
        self.current.right = right.min(VOLUME_MAX);
        self.dirty_volume = true;
        self.store.save(&self.current);
    }

    pub(crate) fn change_volume(&mut self, delta: i8) {
        let left = add_clamped(self.current.left, delta);
        let right = add_clamped(self.current.right, delta);
        self.set_volume(left, right);
    }

    pub(crate) fn set_muted(&mut self, muted: bool) {
        self.current.muted = muted;
        self.dirty_mute = true;
        self.store.save(&self.current);
    }

    /// True while a change is waiting to be written to the device.
    pub(crate) fn has_pending(&self) -> bool {
        self.dirty_volume || self.dirty_mute
    }

    /// Force the full record to be re-sent, e.g. after a decoder reset wiped
    /// the registers.
    pub(crate) fn mark_all_dirty(&mut self) {
        self.dirty_volume = true;
        self.dirty_mute = true;
    }

    /// Push pending changes to the device. A busy device is not an error;
    /// the dirty bits stay set and the next tick retries.
    pub(crate) fn sync<P>(
        &mut self,
        hal: &mut Hal<P>,
        delay: &mut impl DelayNs,
    ) -> Result<(), DriverError<P>>
    where
        P: Vs10xxPeripherals,
    {
        if !self.has_pending() {
            return Ok(());
        }
        if !hal.is_ready()? {
            return Ok(());
        }

        let value = if self.current.muted {
            VOL_POWERDOWN
        } else {
            u16::from(volume_to_device(self.current.left)) << 8
                | u16::from(volume_to_device(self.current.right))
        };
        hal.write_register(addr::VOL, value, delay)?;
        self.dirty_volume = false;
        self.dirty_mute = false;
        debug!("volume preferences synced to the device");
        Ok(())
    }
}

fn add_clamped(level: u8, delta: i8) -> u8 {
    (i16::from(level) + i16::from(delta)).clamp(0, i16::from(VOLUME_MAX)) as u8
}
