//! Bring-up state machine tests against the fake chip: the happy path, every
//! verification failure mode, and the preference restore at the end.

mod common;

use common::{bench, bench_with, BenchConfig, STATUS_VS1053};
use vs10xx_driver::pac::{addr, sm, SpiSpeed};
use vs10xx_driver::{AudioPrefs, CommandError, DeviceState, MediaState, Plugin};

#[test]
fn bring_up_reaches_ready() {
    let mut bench = bench();
    bench.bring_up();

    let chip = bench.chip.borrow();
    // Slow clock first, fast clock later.
    assert_eq!(chip.writes_to(addr::CLOCKF), vec![0x0000, 0x9800]);
    assert_eq!(chip.speed, SpiSpeed::Fast);
    // Soft reset requested native mode.
    assert_eq!(
        chip.writes_to(addr::MODE),
        vec![sm::SM_SDINEW | sm::SM_RESET]
    );
    // Output muted, then configured for 44.1 kHz stereo.
    assert!(chip.writes_to(addr::VOL).contains(&0xFFFF));
    assert_eq!(chip.writes_to(addr::AUDATA), vec![44_101]);
    // Default preferences (full volume) restored as the final volume write.
    assert_eq!(chip.last_write_to(addr::VOL), Some(0x0000));
}

#[test]
fn ready_state_is_stable_across_idle_ticks() {
    let mut bench = bench();
    bench.bring_up();
    bench.ticks(5);
    assert_eq!(bench.driver.device_state(), DeviceState::Ready);
    assert_eq!(bench.driver.media_state(), MediaState::Stopped);
    assert!(!bench.driver.has_failed());
}

#[test]
fn unexpected_mode_readback_never_reaches_ready() {
    let mut bench = bench();
    bench.chip.borrow_mut().mode_after_reset = sm::SM_SDINEW | sm::SM_TESTS;

    bench.ticks(10);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);
}

#[test]
fn wrong_chipset_identity_fails_with_rejected_commands() {
    let mut bench = bench();
    // The reset pulse boots the fake with this identity in STATUS.
    bench.chip.borrow_mut().status_value = STATUS_VS1053;

    bench.ticks(10);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);
    assert_eq!(
        bench.driver.set_volume(10, 10),
        Err(CommandError::DeviceFailed)
    );
}

#[test]
fn self_test_tolerates_glitches_below_the_limit() {
    let mut bench = bench();
    // 9 corrupted write/read cycles (two reads each): still within tolerance.
    bench.chip.borrow_mut().corrupt_vol_reads = 18;
    bench.bring_up();
}

#[test]
fn self_test_fails_exactly_at_the_mismatch_limit() {
    let mut bench = bench();
    // 10 corrupted cycles: the limit itself must already fail.
    bench.chip.borrow_mut().corrupt_vol_reads = 20;
    bench.ticks(10);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);
}

#[test]
fn dreq_stuck_low_after_reset_fails() {
    let mut bench = bench();
    bench.chip.borrow_mut().dreq_after_reset = false;

    bench.ticks(3);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);
}

#[test]
fn no_reset_line_and_dreq_low_fails_immediately() {
    let mut bench = bench_with(BenchConfig {
        without_reset_line: true,
        ..BenchConfig::default()
    });
    bench.chip.borrow_mut().dreq = false;

    bench.ticks(2);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);
}

#[test]
fn no_reset_line_with_booted_chip_comes_up() {
    let mut bench = bench_with(BenchConfig {
        without_reset_line: true,
        ..BenchConfig::default()
    });
    bench.bring_up();
}

#[test]
fn plugins_are_replayed_during_bring_up() {
    static IMAGE: [u16; 6] = [0xA, 0x8002, 0x1234, 0x7, 0x0001, 0x5555];
    static PLUGINS: [Plugin<'static>; 1] = [Plugin::new("test patch", &IMAGE)];

    let mut bench = bench_with(BenchConfig {
        plugins: &PLUGINS,
        ..BenchConfig::default()
    });
    bench.bring_up();

    let chip = bench.chip.borrow();
    assert_eq!(chip.writes_to(0xA), vec![0x1234, 0x1234]);
    assert_eq!(chip.writes_to(0x7), vec![0x5555]);

    // The patch goes in after the fast-speed upgrade and before the output
    // is configured.
    let writes = chip.sci_writes();
    let patch_at = writes
        .iter()
        .position(|&(reg, value)| (reg, value) == (0xA, 0x1234))
        .unwrap();
    let clockf_fast_at = writes
        .iter()
        .position(|&(reg, value)| (reg, value) == (addr::CLOCKF, 0x9800))
        .unwrap();
    let audata_at = writes
        .iter()
        .position(|&(reg, _)| reg == addr::AUDATA)
        .unwrap();
    assert!(clockf_fast_at < patch_at);
    assert!(patch_at < audata_at);
}

#[test]
fn malformed_plugin_fails_bring_up() {
    static IMAGE: [u16; 2] = [0xA, 0x8002];
    static PLUGINS: [Plugin<'static>; 1] = [Plugin::new("truncated patch", &IMAGE)];

    let mut bench = bench_with(BenchConfig {
        plugins: &PLUGINS,
        ..BenchConfig::default()
    });
    bench.ticks(10);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);
}

#[test]
fn stored_preferences_are_restored_to_the_device() {
    let mut bench = bench_with(BenchConfig {
        initial_prefs: Some(AudioPrefs {
            left: 15,
            right: 10,
            muted: false,
        }),
        ..BenchConfig::default()
    });
    bench.bring_up();

    // left 15 -> 127, right 10 -> 169 on the device scale.
    assert_eq!(
        bench.chip.borrow().last_write_to(addr::VOL),
        Some(0x7F_A9)
    );
    assert_eq!(bench.driver.prefs().left, 15);
}

#[test]
fn muted_preference_restores_the_powerdown_sentinel() {
    let mut bench = bench_with(BenchConfig {
        initial_prefs: Some(AudioPrefs {
            left: 20,
            right: 20,
            muted: true,
        }),
        ..BenchConfig::default()
    });
    bench.bring_up();
    assert_eq!(bench.chip.borrow().last_write_to(addr::VOL), Some(0xFFFF));
}

#[test]
fn restart_recovers_a_failed_device() {
    let mut bench = bench();
    bench.chip.borrow_mut().mode_after_reset = 0;
    bench.ticks(10);
    assert_eq!(bench.driver.device_state(), DeviceState::Failed);

    bench.chip.borrow_mut().mode_after_reset = sm::SM_SDINEW;
    bench.driver.restart();
    bench.bring_up();
}
