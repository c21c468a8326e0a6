#![no_std]
#![no_main]

//! Demo for a Raspberry Pi Pico with a VS1053 breakout: brings the decoder
//! up through the tick scheduler, generates a short PCM WAV tone in RAM and
//! plays it on repeat.
//!
//! Wiring: SCK = GPIO2, MOSI = GPIO3, MISO = GPIO4, XCS = GPIO5,
//! DREQ = GPIO6, XRST = GPIO7, XDCS = GPIO8.

use core::ptr::{addr_of, addr_of_mut};

use bsp::entry;
use defmt::info;
use defmt_rtt as _;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::PinState;
use embedded_hal::spi::SpiBus;
use panic_probe as _;

use rp_pico::{
    self as bsp,
    hal::{fugit::RateExtU32, gpio::FunctionSpi},
};

use bsp::hal::{
    clocks::{init_clocks_and_plls, Clock as _},
    gpio, pac,
    sio::Sio,
    watchdog::Watchdog,
};

use vs10xx_driver::pac::{DualSpeedSpi, SpiSpeed};
use vs10xx_driver::{
    AudioPrefs, Blob, DeviceState, MediaState, Peripherals, PrefsStore, TickRate, Vs1053, Vs10xx,
};

type SpiPins = (
    gpio::Pin<gpio::bank0::Gpio3, gpio::FunctionSpi, gpio::PullDown>,
    gpio::Pin<gpio::bank0::Gpio4, gpio::FunctionSpi, gpio::PullDown>,
    gpio::Pin<gpio::bank0::Gpio2, gpio::FunctionSpi, gpio::PullDown>,
);
type SpiPeriph = bsp::hal::Spi<bsp::hal::spi::Enabled, pac::SPI0, SpiPins, 8>;

/// One SPI0 instance, re-clocked between the pre-verification and the
/// operating rate on request.
struct DemoSpi {
    bus: SpiPeriph,
    peri_freq: fugit::HertzU32,
}

impl embedded_hal::spi::ErrorType for DemoSpi {
    type Error = <SpiPeriph as embedded_hal::spi::ErrorType>::Error;
}

impl SpiBus<u8> for DemoSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.bus.transfer(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.transfer_in_place(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.bus.flush()
    }
}

impl DualSpeedSpi for DemoSpi {
    fn set_speed(&mut self, speed: SpiSpeed) {
        let rate = match speed {
            SpiSpeed::Slow => 200u32.kHz(),
            SpiSpeed::Fast => 4u32.MHz(),
        };
        self.bus.set_baudrate(self.peri_freq, rate);
    }
}

/// Microsecond clock on top of the RP2040 timer.
#[derive(Clone, Copy)]
struct TimerClock(bsp::hal::Timer);

impl vs10xx_driver::Clock for TimerClock {
    fn now(&mut self) -> vs10xx_driver::Instant {
        vs10xx_driver::Instant::from_ticks(self.0.get_counter_low())
    }
}

/// The demo has no flash persistence; volume resets on every boot.
struct RamStore;

impl PrefsStore for RamStore {
    fn load(&mut self) -> Option<AudioPrefs> {
        None
    }

    fn save(&mut self, _prefs: &AudioPrefs) {}
}

const SAMPLE_RATE: u32 = 44_100;
const TONE_HZ: u32 = 440;
/// A quarter second of 16-bit stereo PCM.
const FRAMES: u32 = SAMPLE_RATE / 4;
const DATA_BYTES: usize = FRAMES as usize * 4;
const WAV_BYTES: usize = DATA_BYTES + 44;

static mut WAV: [u8; WAV_BYTES] = [0; WAV_BYTES];

/// Write a canonical PCM WAV header plus a square-wave tone.
fn fill_wav(buffer: &mut [u8; WAV_BYTES]) {
    let data_len = DATA_BYTES as u32;
    buffer[..4].copy_from_slice(b"RIFF");
    buffer[4..8].copy_from_slice(&(data_len + 36).to_le_bytes());
    buffer[8..12].copy_from_slice(b"WAVE");
    buffer[12..16].copy_from_slice(b"fmt ");
    buffer[16..20].copy_from_slice(&16u32.to_le_bytes());
    // PCM, 2 channels
    buffer[20..22].copy_from_slice(&1u16.to_le_bytes());
    buffer[22..24].copy_from_slice(&2u16.to_le_bytes());
    buffer[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    // Byte rate and alignment for 16-bit stereo
    buffer[28..32].copy_from_slice(&(SAMPLE_RATE * 4).to_le_bytes());
    buffer[32..34].copy_from_slice(&4u16.to_le_bytes());
    buffer[34..36].copy_from_slice(&16u16.to_le_bytes());
    buffer[36..40].copy_from_slice(b"data");
    buffer[40..44].copy_from_slice(&data_len.to_le_bytes());

    let half_period = SAMPLE_RATE / (2 * TONE_HZ);
    for frame in 0..FRAMES {
        let level: i16 = if (frame / half_period) % 2 == 0 {
            6_000
        } else {
            -6_000
        };
        let offset = 44 + frame as usize * 4;
        buffer[offset..offset + 2].copy_from_slice(&level.to_le_bytes());
        buffer[offset + 2..offset + 4].copy_from_slice(&level.to_le_bytes());
    }
}

#[entry]
fn main() -> ! {
    info!("program start");
    let mut pac = pac::Peripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let sio = Sio::new(pac.SIO);

    // External high-speed crystal on the pico board is 12Mhz
    let external_xtal_freq_hz = 12_000_000u32;
    let clocks = init_clocks_and_plls(
        external_xtal_freq_hz,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();

    let timer = bsp::hal::Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    let mut delay = timer;
    let mut clock = TimerClock(timer);

    let pins = bsp::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    let sck = pins.gpio2.into_function::<FunctionSpi>();
    let mosi = pins.gpio3.into_function::<FunctionSpi>();
    let miso = pins.gpio4.into_function::<FunctionSpi>();
    let xcs = pins
        .gpio5
        .into_push_pull_output_in_state(PinState::High)
        .into_dyn_pin();
    let dreq = pins.gpio6.into_pull_down_input().into_dyn_pin();
    let xrst = pins
        .gpio7
        .into_push_pull_output_in_state(PinState::High)
        .into_dyn_pin();
    let xdcs = pins
        .gpio8
        .into_push_pull_output_in_state(PinState::High)
        .into_dyn_pin();

    let spi = bsp::hal::Spi::<_, _, _, 8>::new(pac.SPI0, (mosi, miso, sck)).init(
        &mut pac.RESETS,
        clocks.peripheral_clock.freq(),
        200u32.kHz(),
        embedded_hal::spi::MODE_0,
    );
    let spi = DemoSpi {
        bus: spi,
        peri_freq: clocks.peripheral_clock.freq(),
    };

    fill_wav(unsafe { &mut *addr_of_mut!(WAV) });
    let wav: &'static [u8] = unsafe { &*addr_of!(WAV) };

    let mut dev = Vs10xx::new(
        Peripherals {
            spi,
            xcs,
            xdcs,
            dreq,
            xrst: Some(xrst),
        },
        Vs1053,
        &[],
        RamStore,
    );
    dev.log_config();

    let mut queued = false;
    loop {
        dev.tick(&mut delay, &mut clock);

        if dev.device_state() == DeviceState::Ready && !queued {
            dev.set_volume(24, 24).ok();
            if dev.play(Blob::new(wav)).is_ok() {
                info!("playing the test tone");
                queued = true;
            }
        }

        // Loop the tone forever.
        if queued
            && dev.media_state() == MediaState::Stopped
            && dev.device_state() == DeviceState::Ready
        {
            queued = false;
        }

        match dev.tick_rate() {
            TickRate::Fast => delay.delay_us(200),
            TickRate::Relaxed => delay.delay_ms(10),
        }
    }
}
