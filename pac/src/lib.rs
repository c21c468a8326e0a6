#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

//! Low-level peripheral access definitions for the VS10XX audio decoder
//! family (VS1003, VS1053 and friends).
//!
//! The serial command interface (SCI) is a 4-byte SPI transaction: an opcode
//! (2 = write, 3 = read), a register address and a 16-bit big-endian value.
//! The serial data interface (SDI) takes raw audio bytes. Which interface a
//! transfer targets is selected with the XCS/XDCS control lines; both lines
//! released means the device ignores the bus.
//!
//! The device boots with a 1.0x clock multiplier and can only follow a slow
//! SPI clock until the multiplier has been raised, so the bus is modelled as
//! a [`DualSpeedSpi`] that is switched between a slow and a fast rate as a
//! unit, never mid-transaction.
//!
//! Every transaction checks the DREQ pin first and fails with
//! [`Vs10xxInterfaceError::Busy`] while it is low. DREQ high guarantees room
//! for at least [`SDI_CHUNK_SIZE`] bytes of data or one SCI command.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

/// SCI opcode for a register write.
pub const WRITE_OP: u8 = 2;
/// SCI opcode for a register read.
pub const READ_OP: u8 = 3;

/// How many bytes the device is guaranteed to accept on SDI while DREQ is
/// high. Data transfers must never exceed this in a single transaction.
pub const SDI_CHUNK_SIZE: usize = 32;

/// SCI register addresses.
pub mod addr {
    /// SCI_MODE - operating mode bits.
    pub const MODE: u8 = 0x0;
    /// SCI_STATUS - chip version and analog control.
    pub const STATUS: u8 = 0x1;
    /// SCI_BASS - bass/treble enhancer.
    pub const BASS: u8 = 0x2;
    /// SCI_CLOCKF - clock multiplier configuration.
    pub const CLOCKF: u8 = 0x3;
    /// SCI_DECODE_TIME - seconds decoded so far.
    pub const DECODE_TIME: u8 = 0x4;
    /// SCI_AUDATA - sample rate and channel count.
    pub const AUDATA: u8 = 0x5;
    /// SCI_WRAM - RAM window data port.
    pub const WRAM: u8 = 0x6;
    /// SCI_WRAMADDR - RAM window address pointer.
    pub const WRAMADDR: u8 = 0x7;
    /// SCI_HDAT0 - stream header data, low word.
    pub const HDAT0: u8 = 0x8;
    /// SCI_HDAT1 - stream format signature, high word.
    pub const HDAT1: u8 = 0x9;
    /// SCI_AIADDR - application code entry point.
    pub const AIADDR: u8 = 0xA;
    /// SCI_VOL - per-channel attenuation.
    pub const VOL: u8 = 0xB;
    /// SCI_AICTRL0 - application control word 0.
    pub const AICTRL0: u8 = 0xC;
    /// SCI_AICTRL1 - application control word 1.
    pub const AICTRL1: u8 = 0xD;
    /// SCI_AICTRL2 - application control word 2.
    pub const AICTRL2: u8 = 0xE;
    /// SCI_AICTRL3 - application control word 3.
    pub const AICTRL3: u8 = 0xF;
    /// Number of addressable SCI registers.
    pub const NUM_REGISTERS: u8 = 16;
}

/// SCI_MODE bit masks.
pub mod sm {
    /// Invert left channel for differential output.
    pub const SM_DIFF: u16 = 1 << 0;
    /// Allow MPEG layers I and II.
    pub const SM_LAYER12: u16 = 1 << 1;
    /// Software reset.
    pub const SM_RESET: u16 = 1 << 2;
    /// Jump out of WAV decoding.
    pub const SM_OUTOFWAV: u16 = 1 << 3;
    /// EarSpeaker spatial processing, low bit.
    pub const SM_EARSPEAKER_LO: u16 = 1 << 4;
    /// Allow SDI test sequences.
    pub const SM_TESTS: u16 = 1 << 5;
    /// Stream mode.
    pub const SM_STREAM: u16 = 1 << 6;
    /// EarSpeaker spatial processing, high bit.
    pub const SM_EARSPEAKER_HI: u16 = 1 << 7;
    /// DCLK active edge (falling when set).
    pub const SM_DACT: u16 = 1 << 8;
    /// SDI bit order (LSB first when set).
    pub const SM_SDIORD: u16 = 1 << 9;
    /// Share XCS between SCI and SDI.
    pub const SM_SDISHARE: u16 = 1 << 10;
    /// VS10XX native mode (independent XCS/XDCS).
    pub const SM_SDINEW: u16 = 1 << 11;
    /// ADPCM recording session.
    pub const SM_ADPCM: u16 = 1 << 12;
    /// ADPCM high-pass filter.
    pub const SM_ADPCM_HP: u16 = 1 << 13;
    /// Record from line input instead of microphone.
    pub const SM_LINE_IN: u16 = 1 << 14;
}

/// The two SPI clock rates used to talk to the device.
///
/// [`SpiSpeed::Slow`] (~200 kHz) is safe directly after reset while the chip
/// still runs from the bare crystal; [`SpiSpeed::Fast`] (~4 MHz) is only
/// legal once the clock multiplier has been configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SpiSpeed {
    /// Pre-verification rate, legal from power-on.
    Slow,
    /// Normal operating rate, legal after the clock upgrade.
    Fast,
}

/// An SPI bus whose clock rate can be switched at runtime.
///
/// The HAL-specific wrapper decides what "slow" and "fast" mean; the only
/// requirement is that the switch never happens mid-transaction.
pub trait DualSpeedSpi: SpiBus<u8> {
    /// Reconfigure the bus clock rate.
    fn set_speed(&mut self, speed: SpiSpeed);
}

/// The bus and control lines needed to communicate with a VS10XX chip.
#[derive(Debug)]
pub struct Vs10xxInterface<TSpi, TOut, TIn> {
    spi: TSpi,
    xcs: TOut,
    xdcs: TOut,
    dreq: TIn,
    speed: SpiSpeed,
}

/// The error type returned by the interface APIs.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Vs10xxInterfaceError<ESpi, EOut, EIn> {
    /// The SPI bus failed to complete a transfer.
    #[error("SPI error")]
    Spi(#[source] ESpi),
    /// Driving one of the XCS/XDCS control lines failed.
    #[error("control line error")]
    Pin(#[source] EOut),
    /// The DREQ input failed to provide a value.
    #[error("DREQ input error")]
    Dreq(#[source] EIn),
    /// DREQ is low, the device cannot take a command or data right now.
    #[error("VS10XX is busy (DREQ is low)")]
    Busy,
}

impl<TSpi, TOut, TIn> Vs10xxInterface<TSpi, TOut, TIn> {
    /// Create a new interface. Starts in [`SpiSpeed::Slow`], matching the
    /// state of a freshly powered chip.
    pub const fn new(spi: TSpi, xcs: TOut, xdcs: TOut, dreq: TIn) -> Self {
        Vs10xxInterface {
            spi,
            xcs,
            xdcs,
            dreq,
            speed: SpiSpeed::Slow,
        }
    }

    /// The currently selected bus rate.
    pub fn speed(&self) -> SpiSpeed {
        self.speed
    }
}

impl<TSpi, TOut, TIn> Vs10xxInterface<TSpi, TOut, TIn>
where
    TSpi: DualSpeedSpi,
{
    /// Switch the bus rate. Takes effect from the next transaction.
    pub fn set_speed(&mut self, speed: SpiSpeed) {
        self.speed = speed;
        self.spi.set_speed(speed);
    }
}

impl<TSpi, TOut, TIn> Vs10xxInterface<TSpi, TOut, TIn>
where
    TIn: InputPin,
{
    /// Check if the device can accept a command or a data chunk.
    pub fn is_ready(&mut self) -> Result<bool, TIn::Error> {
        self.dreq.is_high()
    }
}

impl<TSpi, TOut, TIn> Vs10xxInterface<TSpi, TOut, TIn>
where
    TSpi: SpiBus<u8>,
    TOut: OutputPin,
    TIn: InputPin,
{
    /// Release both control lines, leaving the bus free for other devices.
    pub fn release_lines(
        &mut self,
    ) -> Result<(), Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>> {
        self.xdcs.set_high().map_err(Vs10xxInterfaceError::Pin)?;
        self.xcs.set_high().map_err(Vs10xxInterfaceError::Pin)
    }

    /// Stream one chunk of audio data over SDI.
    ///
    /// `data` must not exceed [`SDI_CHUNK_SIZE`]; DREQ high only guarantees
    /// buffer room for that much.
    pub fn send_data(
        &mut self,
        data: &[u8],
    ) -> Result<(), Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>> {
        debug_assert!(data.len() <= SDI_CHUNK_SIZE);

        if !self.dreq.is_high().map_err(Vs10xxInterfaceError::Dreq)? {
            return Err(Vs10xxInterfaceError::Busy);
        }

        self.xcs.set_high().map_err(Vs10xxInterfaceError::Pin)?;
        self.xdcs.set_low().map_err(Vs10xxInterfaceError::Pin)?;
        self.spi.write(data).map_err(Vs10xxInterfaceError::Spi)?;
        self.spi.flush().map_err(Vs10xxInterfaceError::Spi)?;
        self.release_lines()
    }
}

impl<TSpi, TOut, TIn> device_driver::RegisterInterface for Vs10xxInterface<TSpi, TOut, TIn>
where
    TSpi: SpiBus<u8>,
    TOut: OutputPin,
    TIn: InputPin,
{
    type Error = Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>;
    type AddressType = u8;

    fn write_register(
        &mut self,
        address: Self::AddressType,
        size_bits: u32,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        assert_eq!(size_bits, 16);
        assert_eq!(data.len(), 2);

        if !self.dreq.is_high().map_err(Vs10xxInterfaceError::Dreq)? {
            return Err(Vs10xxInterfaceError::Busy);
        }

        self.xdcs.set_high().map_err(Vs10xxInterfaceError::Pin)?;
        self.xcs.set_low().map_err(Vs10xxInterfaceError::Pin)?;

        let frame = [WRITE_OP, address, data[0], data[1]];
        self.spi.write(&frame).map_err(Vs10xxInterfaceError::Spi)?;
        self.spi.flush().map_err(Vs10xxInterfaceError::Spi)?;

        self.release_lines()
    }

    fn read_register(
        &mut self,
        address: Self::AddressType,
        size_bits: u32,
        data: &mut [u8],
    ) -> Result<(), Self::Error> {
        assert_eq!(size_bits, 16);
        assert_eq!(data.len(), 2);

        if !self.dreq.is_high().map_err(Vs10xxInterfaceError::Dreq)? {
            return Err(Vs10xxInterfaceError::Busy);
        }

        self.xdcs.set_high().map_err(Vs10xxInterfaceError::Pin)?;
        self.xcs.set_low().map_err(Vs10xxInterfaceError::Pin)?;

        let setup = [READ_OP, address];
        self.spi.write(&setup).map_err(Vs10xxInterfaceError::Spi)?;
        self.spi.read(data).map_err(Vs10xxInterfaceError::Spi)?;
        self.spi.flush().map_err(Vs10xxInterfaceError::Spi)?;

        self.release_lines()
    }
}

impl<TSpi, TOut, TIn> Vs10xx<Vs10xxInterface<TSpi, TOut, TIn>>
where
    TIn: InputPin,
{
    /// Check if the device is ready for a command or a data chunk.
    ///
    /// Register operations fail with [`Vs10xxInterfaceError::Busy`] while
    /// this returns `Ok(false)`.
    pub fn is_ready(&mut self) -> Result<bool, TIn::Error> {
        self.interface.is_ready()
    }

    /// The currently selected bus rate.
    pub fn speed(&self) -> SpiSpeed {
        self.interface.speed()
    }
}

impl<TSpi, TOut, TIn> Vs10xx<Vs10xxInterface<TSpi, TOut, TIn>>
where
    TSpi: DualSpeedSpi,
{
    /// Switch the bus rate. Takes effect from the next transaction.
    pub fn set_speed(&mut self, speed: SpiSpeed) {
        self.interface.set_speed(speed);
    }
}

impl<TSpi, TOut, TIn> Vs10xx<Vs10xxInterface<TSpi, TOut, TIn>>
where
    TSpi: SpiBus<u8>,
    TOut: OutputPin,
    TIn: InputPin,
{
    /// Release both control lines.
    pub fn release_lines(
        &mut self,
    ) -> Result<(), Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>> {
        self.interface.release_lines()
    }

    /// Stream one chunk (at most [`SDI_CHUNK_SIZE`] bytes) of audio data.
    pub fn send_data(
        &mut self,
        data: &[u8],
    ) -> Result<(), Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>> {
        self.interface.send_data(data)
    }

    /// Write a register by raw address.
    ///
    /// Plugin images address registers by number, including addresses the
    /// typed views do not cover, so this takes any byte address.
    pub fn write_raw(
        &mut self,
        address: u8,
        value: u16,
    ) -> Result<(), Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>> {
        device_driver::RegisterInterface::write_register(
            &mut self.interface,
            address,
            16,
            &value.to_be_bytes(),
        )
    }

    /// Read a register by raw address.
    pub fn read_raw(
        &mut self,
        address: u8,
    ) -> Result<u16, Vs10xxInterfaceError<TSpi::Error, TOut::Error, TIn::Error>> {
        let mut data = [0u8; 2];
        device_driver::RegisterInterface::read_register(&mut self.interface, address, 16, &mut data)?;
        Ok(u16::from_be_bytes(data))
    }
}

device_driver::create_device!(
    device_name: Vs10xx,
    dsl: {
        config {
            type RegisterAddressType = u8;
            type DefaultByteOrder = BE;
            type DefmtFeature = "defmt-03";
        }
        /// Address-indexed access to any SCI register.
        ///
        /// Plugin images and the bus self-test address registers by number,
        /// so they go through here rather than the typed views below.
        register Raw {
            const ADDRESS = 0x0;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;
            const REPEAT = {
                count: 16,
                stride: 1,
            };

            /// The raw register value.
            value: uint = 0..16,
        },
        /// SCI_MODE - controls the operating mode of the decoder.
        register Mode {
            const ADDRESS = 0x0;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Invert the left channel for differential output.
            differential: bool = 0,

            /// Allow MPEG layers I and II in addition to layer III.
            layer12: bool = 1,

            /// Set together with the desired mode bits to soft-reset the
            /// decoder firmware.
            reset: bool = 2,

            /// Abandon an in-progress WAV stream.
            out_of_wav: bool = 3,

            /// EarSpeaker spatial processing, low bit.
            earspeaker_lo: bool = 4,

            /// Allow SDI test sequences.
            allow_tests: bool = 5,

            /// Stream mode (decode as data arrives, adjusting playback rate).
            stream_mode: bool = 6,

            /// EarSpeaker spatial processing, high bit.
            earspeaker_hi: bool = 7,

            /// Active clock edge for the SDI interface.
            dclk_active_edge: uint as enum DclkEdge {
                Rising = 0,
                Falling = 1,
            } = 8..=8,

            /// Bit order for the SDI interface.
            sdi_bit_order: uint as enum SdiBitOrder {
                MsbFirst = 0,
                LsbFirst = 1,
            } = 9..=9,

            /// Derive XDCS by inverting XCS instead of using both lines.
            sdi_share: bool = 10,

            /// VS10XX native mode: XCS and XDCS are independent lines.
            sdi_new: bool = 11,

            /// Start an ADPCM recording session (set together with reset).
            adpcm: bool = 12,

            /// High-pass filter the ADPCM input.
            adpcm_hp: bool = 13,

            /// Record from the line input instead of the microphone.
            line_input: bool = 14,
        },
        /// SCI_STATUS - chip identity and analog control.
        register Status {
            const ADDRESS = 0x1;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// The version nibble identifying the family member.
            version: uint as enum Version {
                Vs1001 = 0,
                Vs1011 = 1,
                Vs1002 = 2,
                Vs1003 = 3,
                Vs1053 = 4,
                Vs1033 = 5,
                Vs1103 = 6,
                Vs1063 = 7,
                Unknown = catch_all
            } = 4..=7,

            /// Analog driver powerdown. Normally owned by the system
            /// firmware; may be set shortly before reset to cut transients.
            analog_driver_powerdown: bool = 3,

            /// Internal analog powerdown, system firmware use only.
            analog_internal_powerdown: bool = 2,

            /// Analog volume control, system firmware use only.
            /// 0 = -0 dB, 1 = -6 dB, 3 = -12 dB.
            analog_volume: uint = 0..=1,
        },
        /// SCI_BASS - bass and treble enhancer.
        register Bass {
            const ADDRESS = 0x2;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Treble boost in 1.5 dB steps, 0 disables.
            treble_amplitude: int = 12..=15,

            /// Treble corner frequency in 1 kHz steps.
            treble_bottom_frequency: uint = 8..=11,

            /// Bass boost in 1 dB steps, 0 disables.
            bass_amplitude: uint = 4..=7,

            /// Bass corner frequency in 10 Hz steps, range 2..=15.
            bass_bottom_frequency: uint = 0..=3,
        },
        /// SCI_CLOCKF - input clock and multiplier configuration.
        register Clockf {
            const ADDRESS = 0x3;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// CLKI multiplier: CLKI = XTALI * (1 + multiplier/2).
            multiplier: uint = 13..=15,

            /// Extra multiplier headroom the firmware may add for hard
            /// streams, in 0.5x steps.
            allowed_addition: uint = 11..=12,

            /// XTALI frequency as (XTALI - 8 MHz) / 4 kHz; 0 means the
            /// default 12.288 MHz crystal.
            input_frequency: uint = 0..=10,
        },
        /// SCI_DECODE_TIME - seconds of audio decoded since the last clear.
        ///
        /// Writable; a new value should be written twice in a row to take.
        register DecodeTime {
            const ADDRESS = 0x4;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Decode time in full seconds.
            value: uint = 0..16,
        },
        /// SCI_AUDATA - sample rate and channel information of the current
        /// stream. Writable to force the output rate.
        register Audata {
            const ADDRESS = 0x5;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Stereo flag; shares the word with the (even) sample rate.
            stereo: bool = 0,

            /// Sample rate divided by two.
            sample_rate: uint = 1..16,
        },
        /// SCI_WRAM - data port of the RAM window. The address pointer in
        /// [`WramAddr`] auto-increments after each full word access.
        register Wram {
            const ADDRESS = 0x6;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// One 16-bit word of instruction or data RAM.
            value: uint = 0..16,
        },
        /// SCI_WRAMADDR - address pointer for [`Wram`] accesses. Offset
        /// 0x0000 addresses X RAM, 0x4000 Y RAM, 0x8000 instruction RAM.
        register WramAddr {
            type Access = WO;

            const ADDRESS = 0x7;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// The RAM window pointer.
            value: uint = 0..16,
        },
        /// SCI_HDAT0 - stream header data, meaning depends on the format
        /// being decoded.
        register Hdat0 {
            type Access = RO;

            const ADDRESS = 0x8;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Header word.
            value: uint = 0..16,
        },
        /// SCI_HDAT1 - stream format signature, zero when no stream is
        /// being decoded.
        register Hdat1 {
            type Access = RO;

            const ADDRESS = 0x9;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Format signature word.
            value: uint = 0..16,
        },
        /// SCI_AIADDR - entry point of application code previously loaded
        /// through the RAM window. Leave zero when no application is used.
        register AiAddr {
            const ADDRESS = 0xA;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Application start address.
            value: uint = 0..16,
        },
        /// SCI_VOL - per-channel attenuation in -0.5 dB steps.
        ///
        /// 0 = full volume, 254 = -127 dB; writing 255 to both channels
        /// activates analog powerdown.
        register Vol {
            const ADDRESS = 0xB;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Right channel attenuation.
            right: uint = 0..8,

            /// Left channel attenuation.
            left: uint = 8..16,
        },
        /// SCI_AICTRL0..3 - application control words.
        register AiCtrl {
            const ADDRESS = 0xC;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;
            const REPEAT = {
                count: 4,
                stride: 1,
            };

            /// Application-defined value.
            value: uint = 0..16,
        },
    }
);
