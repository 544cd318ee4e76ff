//! End-to-end scenarios over a fake sysfs tree and the mock platform.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breakout::board::{mock, Board, Capabilities, FsLayout, MuxCmd, MuxStep, PinMapping, PinRecord, Platform};
use breakout::gpio::{Direction, Edge, Level, Mode};
use breakout::Error;

fn fake_sysfs(lines: &[u32]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("export"), "").unwrap();
    fs::write(dir.path().join("unexport"), "").unwrap();
    for &line in lines {
        let pin_dir = dir.path().join(format!("gpio{line}"));
        fs::create_dir(&pin_dir).unwrap();
        fs::write(pin_dir.join("direction"), "in").unwrap();
        fs::write(pin_dir.join("value"), "0").unwrap();
        fs::write(pin_dir.join("edge"), "none").unwrap();
        fs::write(pin_dir.join("active_low"), "0").unwrap();
    }
    dir
}

fn gpio_records(raw_lines: &[u32]) -> Vec<PinRecord> {
    raw_lines
        .iter()
        .map(|&line| PinRecord {
            name: format!("IO{line}"),
            caps: Capabilities::gpio(),
            gpio: Some(PinMapping::raw(line)),
            ..Default::default()
        })
        .collect()
}

fn sysfs_platform(root: &Path, raw_lines: &[u32]) -> Platform {
    Platform::new(sysfs_board("sysfs-e2e", root, raw_lines))
}

fn sysfs_board(name: &str, root: &Path, raw_lines: &[u32]) -> Board {
    let pins = gpio_records(raw_lines);
    let count = pins.len();
    let mut fs_layout = FsLayout::default();
    fs_layout.sysfs_gpio = root.to_path_buf();
    Board::builder(name)
        .pins(pins)
        .gpio_count(count)
        .fs_layout(fs_layout)
        .build()
        .unwrap()
}

fn value_of(root: &Path, line: u32) -> String {
    fs::read_to_string(root.join(format!("gpio{line}")).join("value")).unwrap()
}

// Scenario A: a multi-pin context keeps the caller's pin ordering from
// write through read-back.
#[test]
fn multi_pin_roundtrip_preserves_order() {
    let root = fake_sysfs(&[3, 5]);
    let platform = sysfs_platform(root.path(), &[3, 5]);

    let mut gpio = platform.gpio_multi(&[0, 1]).unwrap();
    gpio.set_dir(Direction::Out).unwrap();
    gpio.write_multi(&[Level::High, Level::Low]).unwrap();

    let mut out = [Level::Low; 2];
    gpio.read_multi(&mut out).unwrap();
    assert_eq!(out, [Level::High, Level::Low]);
    assert_eq!(value_of(root.path(), 3), "1");
    assert_eq!(value_of(root.path(), 5), "0");
    gpio.close().unwrap();
}

// Scenario B, generic half: on a board with no overrides, isr() runs
// the full generic path (edge file written, thread spawned blocking on
// the value file) and isr_exit() cancels that genuinely blocked poll.
#[test]
fn generic_isr_registration_and_cancellation() {
    let root = fake_sysfs(&[7]);
    let platform = sysfs_platform(root.path(), &[7]);

    let mut gpio = platform.gpio(0).unwrap();
    gpio.set_dir(Direction::In).unwrap();
    gpio.set_isr(Edge::Rising, || {}).unwrap();
    assert_eq!(
        fs::read_to_string(root.path().join("gpio7").join("edge")).unwrap(),
        "rising"
    );

    gpio.isr_exit().unwrap();
    assert_eq!(gpio.edge(), Edge::None);
    gpio.isr_exit().unwrap();
    gpio.close().unwrap();
}

// Scenario B, delivery half: with the interrupt source simulated, one
// edge means exactly one callback with the registered state, and exit
// joins the thread.
#[test]
fn simulated_edge_invokes_callback_once() {
    let (platform, state) = mock::platform(8).unwrap();
    let mut gpio = platform.gpio(7).unwrap();
    gpio.set_dir(Direction::In).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    gpio.set_isr(Edge::Rising, move || {
        seen.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    state.pulse(7).unwrap();
    for _ in 0..400 {
        if count.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // No extra invocations trickle in.
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    gpio.isr_exit().unwrap();
    gpio.close().unwrap();
}

// Scenario C: a two-step mux chain leaves the sibling pins at the
// absolute levels the chain dictates, observable directly on the
// backing files.
#[test]
fn mux_chain_configures_sibling_pins() {
    let root = fake_sysfs(&[4, 20, 21]);
    let mut board = sysfs_board("mux-e2e", root.path(), &[4, 20, 21]);
    board.pins[0].gpio.as_mut().unwrap().mux = vec![
        MuxStep {
            pin: 20,
            cmd: MuxCmd::SetOutValue,
            value: 0,
        },
        MuxStep {
            pin: 21,
            cmd: MuxCmd::SetOutValue,
            value: 1,
        },
    ];
    let platform = Platform::new(board);

    let gpio = platform.gpio(0).unwrap();
    assert_eq!(value_of(root.path(), 20), "0");
    assert_eq!(value_of(root.path(), 21), "1");
    gpio.close().unwrap();
}

// Scenario D: pull modes need a pull-enable line; a record without one
// refuses the mode and leaves the cached mode untouched.
#[test]
fn pullup_without_enable_pin_is_unsupported() {
    let root = fake_sysfs(&[4]);
    let platform = sysfs_platform(root.path(), &[4]);
    let mut gpio = platform.gpio(0).unwrap();

    assert!(matches!(
        gpio.set_mode(Mode::Pullup),
        Err(Error::FeatureNotSupported(_))
    ));
    assert_eq!(gpio.mode(), None);
    gpio.close().unwrap();
}

// Override precedence: with a replace hook installed the generic
// implementation must never run.
#[test]
fn replace_hook_shadows_generic_implementation() {
    static GENERIC_WOULD_HAVE_RUN: AtomicBool = AtomicBool::new(false);

    fn read_replace(
        _ctx: &mut breakout::Gpio,
        _pos: usize,
    ) -> breakout::Result<Level> {
        Ok(Level::High)
    }
    fn read_pre(_ctx: &mut breakout::Gpio, _pos: usize) -> breakout::Result<()> {
        // Only reachable if replace were ignored.
        GENERIC_WOULD_HAVE_RUN.store(true, Ordering::SeqCst);
        Ok(())
    }

    let root = fake_sysfs(&[4]);
    let mut board = sysfs_board("override-e2e", root.path(), &[4]);
    board.overrides.gpio.read.replace = Some(read_replace);
    board.overrides.gpio.read.pre = Some(read_pre);
    let platform = Platform::new(board);

    let mut gpio = platform.gpio(0).unwrap();
    // The backing file reads low; the override says high.
    assert_eq!(gpio.read().unwrap(), Level::High);
    assert!(!GENERIC_WOULD_HAVE_RUN.load(Ordering::SeqCst));
    gpio.close().unwrap();
}

// A sub-platform segment extends the pin namespace and carries its own
// filesystem roots.
#[test]
fn sub_platform_pins_resolve_to_their_segment() {
    let primary_root = fake_sysfs(&[3]);
    let bridge_root = fake_sysfs(&[0]);

    let mut platform = Platform::new(sysfs_board("primary", primary_root.path(), &[3]));
    platform.push_sub_platform(sysfs_board("bridge", bridge_root.path(), &[0]));

    // Pin 1 lands on the bridge segment's line 0.
    let mut gpio = platform.gpio(1).unwrap();
    gpio.set_dir(Direction::Out).unwrap();
    gpio.write(Level::High).unwrap();
    assert_eq!(value_of(bridge_root.path(), 0), "1");
    // The primary's tree is untouched.
    assert_eq!(value_of(primary_root.path(), 3), "0");
    gpio.close().unwrap();
}

// Closing with owner=false leaves the line exported for whoever else
// claims it; owning contexts release it.
#[test]
fn close_respects_ownership() {
    let root = fake_sysfs(&[9]);
    let platform = sysfs_platform(root.path(), &[9]);

    let mut borrowed = platform.gpio(0).unwrap();
    borrowed.set_owner(false).unwrap();
    borrowed.close().unwrap();
    assert_eq!(
        fs::read_to_string(root.path().join("unexport")).unwrap(),
        ""
    );

    let owner = platform.gpio(0).unwrap();
    assert!(owner.owner());
    owner.close().unwrap();
    assert_eq!(
        fs::read_to_string(root.path().join("unexport")).unwrap(),
        "9"
    );
}
