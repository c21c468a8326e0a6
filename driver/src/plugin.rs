//! Loader for firmware patches and plugins.
//!
//! Patch code is distributed by the chip vendor in a compressed format: a
//! flat sequence of 16-bit words encoding blocks of register writes. Each
//! block starts with a register address and a count word. A set high bit in
//! the count selects replication mode (one payload word written `count &
//! 0x7FFF` times, used for memory fills); a clear high bit selects copy mode
//! (`count` distinct payload words written in order). The format of the
//! published `.plg` files is reproduced exactly so third-party images load
//! unmodified.

use embedded_hal::delay::DelayNs;

use crate::hal::{Hal, READY_TIMEOUT};
use crate::{DriverError, Vs10xxPeripherals};

/// A firmware patch image for the decoder.
#[derive(Debug, Clone, Copy)]
pub struct Plugin<'a> {
    description: &'static str,
    data: &'a [u16],
}

/// Structural errors in a plugin image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum PluginFormatError {
    /// The image ends in the middle of a block.
    #[error("plugin image ends in the middle of a block")]
    Truncated,
    /// A block address does not fit the one-byte register field of an SCI
    /// command.
    #[error("plugin block targets invalid register {0:#x}")]
    BadAddress(u16),
}

impl<'a> Plugin<'a> {
    /// Wrap a plugin image. `data` is the word sequence of a `.plg` file.
    pub const fn new(description: &'static str, data: &'a [u16]) -> Self {
        Plugin { description, data }
    }

    /// A short description of the plugin, used for config dumps.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Replay the image as register writes and wait for the device to
    /// settle.
    pub(crate) fn load<P>(
        &self,
        hal: &mut Hal<P>,
        delay: &mut impl DelayNs,
    ) -> Result<(), DriverError<P>>
    where
        P: Vs10xxPeripherals,
    {
        apply(self.data, |addr, value| hal.write_register(addr, value, delay))?;
        hal.wait_for_ready(delay, READY_TIMEOUT)
    }
}

/// Decode `words` block by block, handing every register write to `write`.
pub(crate) fn apply<E>(
    words: &[u16],
    mut write: impl FnMut(u8, u16) -> Result<(), E>,
) -> Result<(), E>
where
    E: From<PluginFormatError>,
{
    let mut i = 0;
    while i < words.len() {
        let address = words[i];
        if address > 0xFF {
            return Err(PluginFormatError::BadAddress(address).into());
        }
        let address = address as u8;
        let count = *words.get(i + 1).ok_or(PluginFormatError::Truncated)?;
        i += 2;

        if count & 0x8000 != 0 {
            // Replication mode: one payload word, written n times.
            let n = count & 0x7FFF;
            let value = *words.get(i).ok_or(PluginFormatError::Truncated)?;
            i += 1;
            for _ in 0..n {
                write(address, value)?;
            }
        } else {
            // Copy mode: n distinct payload words.
            for _ in 0..count {
                let value = *words.get(i).ok_or(PluginFormatError::Truncated)?;
                i += 1;
                write(address, value)?;
            }
        }
    }
    Ok(())
}
