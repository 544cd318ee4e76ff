//! Mock platform: a board whose override table replaces every GPIO
//! primitive with in-memory state.
//!
//! Useful for running against no hardware at all — the crate's own test
//! suite drives it, and downstream code can use it the same way.
//! Interrupts are real: the `isr` hook wires the interrupt thread to a
//! pipe, and [`MockState::pulse`] simulates an edge by writing one
//! event record.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::board::{Board, Capabilities, PinMapping, PinRecord, Platform};
use crate::error::{Error, Result};
use crate::gpio::{Direction, Edge, EventSource, Gpio, Level};
use crate::overrides::OverrideTable;
use crate::tracing::prelude::*;

/// Per-line simulated state.
struct MockPin {
    dir: Direction,
    level: Level,
    edge: Edge,
    event_tx: Option<File>,
}

impl Default for MockPin {
    fn default() -> Self {
        // Lines come up as inputs reading low.
        MockPin {
            dir: Direction::In,
            level: Level::Low,
            edge: Edge::None,
            event_tx: None,
        }
    }
}

/// Shared state of a mock board, keyed by raw line number.
pub struct MockState {
    pins: Mutex<HashMap<u32, MockPin>>,
}

impl MockState {
    /// Size of one simulated event record, mirroring the kernel's
    /// line-event record.
    pub const EVENT_RECORD_LEN: usize = 16;

    fn new() -> MockState {
        MockState {
            pins: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, MockPin>> {
        self.pins.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current level of a line, if it has ever been touched.
    pub fn level(&self, line: u32) -> Option<Level> {
        self.lock().get(&line).map(|p| p.level)
    }

    /// Externally drive a line, as the wired-up peripheral would.
    pub fn set_level(&self, line: u32, level: Level) {
        self.lock().entry(line).or_default().level = level;
    }

    /// Current direction of a line.
    pub fn direction(&self, line: u32) -> Option<Direction> {
        self.lock().get(&line).map(|p| p.dir)
    }

    /// Current edge configuration of a line.
    pub fn edge(&self, line: u32) -> Option<Edge> {
        self.lock().get(&line).map(|p| p.edge)
    }

    /// Simulate one edge event on a line with a registered ISR.
    pub fn pulse(&self, line: u32) -> Result<()> {
        let mut pins = self.lock();
        let pin = pins
            .get_mut(&line)
            .ok_or_else(|| Error::InvalidParameter(format!("line {line} was never opened")))?;
        let tx = pin
            .event_tx
            .as_mut()
            .ok_or_else(|| Error::NoResources(format!("no isr registered on line {line}")))?;
        tx.write_all(&[0u8; Self::EVENT_RECORD_LEN])
            .map_err(|e| Error::Unspecified(format!("event injection failed: {e}")))
    }
}

fn state_of(ctx: &Gpio) -> Result<Arc<MockState>> {
    ctx.board()
        .platform_data
        .clone()
        .and_then(|data| data.downcast::<MockState>().ok())
        .ok_or_else(|| Error::Unspecified("mock platform data missing from board".into()))
}

fn line_at(ctx: &Gpio, pos: usize) -> Result<u32> {
    ctx.init_mappings()
        .get(pos)
        .map(|m| m.pinmap)
        .ok_or(Error::InvalidHandle("line position out of range"))
}

fn gpio_init_replace(ctx: &mut Gpio, _: ()) -> Result<()> {
    let state = state_of(ctx)?;
    let mut pins = state.lock();
    for mapping in ctx.init_mappings() {
        pins.entry(mapping.pinmap).or_default();
    }
    trace!(lines = ctx.init_mappings().len(), "mock gpio context ready");
    Ok(())
}

fn gpio_dir_replace(ctx: &mut Gpio, dir: Direction) -> Result<()> {
    let state = state_of(ctx)?;
    let mut pins = state.lock();
    for pos in 0..ctx.pin_count() {
        let line = line_at(ctx, pos)?;
        let pin = pins.entry(line).or_default();
        match dir {
            Direction::OutHigh => {
                pin.dir = Direction::Out;
                pin.level = Level::High;
            }
            Direction::OutLow => {
                pin.dir = Direction::Out;
                pin.level = Level::Low;
            }
            Direction::In | Direction::Out => pin.dir = dir,
        }
    }
    Ok(())
}

fn gpio_read_dir_replace(ctx: &mut Gpio, _: ()) -> Result<Direction> {
    let state = state_of(ctx)?;
    let line = line_at(ctx, 0)?;
    let pins = state.lock();
    pins.get(&line)
        .map(|p| p.dir)
        .ok_or(Error::InvalidHandle("line never initialised"))
}

fn gpio_read_replace(ctx: &mut Gpio, pos: usize) -> Result<Level> {
    let state = state_of(ctx)?;
    let line = line_at(ctx, pos)?;
    let pins = state.lock();
    pins.get(&line)
        .map(|p| p.level)
        .ok_or(Error::InvalidHandle("line never initialised"))
}

fn gpio_write_replace(ctx: &mut Gpio, (pos, level): (usize, Level)) -> Result<()> {
    let state = state_of(ctx)?;
    let line = line_at(ctx, pos)?;
    state.lock().entry(line).or_default().level = level;
    Ok(())
}

fn gpio_edge_replace(ctx: &mut Gpio, edge: Edge) -> Result<()> {
    let state = state_of(ctx)?;
    let mut pins = state.lock();
    for pos in 0..ctx.pin_count() {
        let line = line_at(ctx, pos)?;
        pins.entry(line).or_default().edge = edge;
    }
    Ok(())
}

fn gpio_isr_replace(ctx: &mut Gpio, edge: Edge) -> Result<()> {
    let state = state_of(ctx)?;
    let line = line_at(ctx, 0)?;
    let (rx, tx) = nix::unistd::pipe()
        .map_err(|e| Error::NoResources(format!("mock event pipe: {e}")))?;
    {
        let mut pins = state.lock();
        let pin = pins.entry(line).or_default();
        pin.edge = edge;
        pin.event_tx = Some(File::from(tx));
    }
    ctx.attach_isr_source(EventSource::records(
        File::from(rx),
        MockState::EVENT_RECORD_LEN,
    ))
}

/// Build a mock board with `num_pins` GPIO-capable pins, returning the
/// board and a handle for inspecting and driving the simulated lines.
pub fn board(num_pins: usize) -> Result<(Board, Arc<MockState>)> {
    let state = Arc::new(MockState::new());

    let mut overrides = OverrideTable::default();
    overrides.gpio.init.replace = Some(gpio_init_replace);
    overrides.gpio.dir.replace = Some(gpio_dir_replace);
    overrides.gpio.read_dir.replace = Some(gpio_read_dir_replace);
    overrides.gpio.read.replace = Some(gpio_read_replace);
    overrides.gpio.write.replace = Some(gpio_write_replace);
    overrides.gpio.edge_mode.replace = Some(gpio_edge_replace);
    overrides.gpio.isr.replace = Some(gpio_isr_replace);

    let pins = (0..num_pins)
        .map(|i| PinRecord {
            name: format!("MOCK{i}"),
            caps: Capabilities::gpio(),
            gpio: Some(PinMapping::raw(i as u32)),
            ..Default::default()
        })
        .collect();

    let board = Board::builder("mock platform")
        .pins(pins)
        .gpio_count(num_pins)
        .overrides(overrides)
        .platform_data(Arc::clone(&state) as Arc<dyn std::any::Any + Send + Sync>)
        .build()?;
    Ok((board, state))
}

/// [`board`] wrapped as a single-segment platform.
pub fn platform(num_pins: usize) -> Result<(Platform, Arc<MockState>)> {
    let (board, state) = board(num_pins)?;
    Ok((Platform::new(board), state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{MuxCmd, MuxStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_replace_hooks_bypass_generic_backends() {
        // No sysfs tree exists anywhere; every operation that reached
        // the generic path would fail with InvalidResource.
        let (platform, state) = platform(4).unwrap();
        let mut gpio = platform.gpio(2).unwrap();

        assert_eq!(gpio.dir().unwrap(), Direction::In);
        gpio.set_dir(Direction::OutHigh).unwrap();
        assert_eq!(gpio.dir().unwrap(), Direction::Out);
        assert_eq!(gpio.read().unwrap(), Level::High);

        gpio.write(Level::Low).unwrap();
        assert_eq!(state.level(2), Some(Level::Low));

        state.set_level(2, Level::High);
        assert_eq!(gpio.read().unwrap(), Level::High);
        gpio.close().unwrap();
    }

    #[test]
    fn test_mux_chain_drives_simulated_aux_pins() {
        let (mut board, state) = board(2).unwrap();
        // Routing pin 0 to its gpio function requires sibling lines 20
        // low and 21 high.
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
        assert_eq!(state.level(20), Some(Level::Low));
        assert_eq!(state.level(21), Some(Level::High));
        assert_eq!(state.direction(20), Some(Direction::Out));
        gpio.close().unwrap();
    }

    #[test]
    fn test_isr_fires_once_per_pulse_and_exit_is_idempotent() {
        let (platform, state) = platform(1).unwrap();
        let mut gpio = platform.gpio(0).unwrap();
        gpio.set_dir(Direction::In).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        gpio.set_isr(Edge::Rising, move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(state.edge(0), Some(Edge::Rising));

        // A second registration must be refused while one is active.
        assert!(matches!(
            gpio.set_isr(Edge::Rising, || {}),
            Err(Error::NoResources(_))
        ));

        for _ in 0..3 {
            state.pulse(0).unwrap();
        }
        for _ in 0..400 {
            if count.load(Ordering::SeqCst) >= 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);

        gpio.isr_exit().unwrap();
        assert_eq!(state.edge(0), Some(Edge::None));
        // Idempotent with nothing registered.
        gpio.isr_exit().unwrap();

        // And the slot is free for a fresh registration.
        gpio.set_isr(Edge::Falling, || {}).unwrap();
        gpio.isr_exit().unwrap();
        gpio.close().unwrap();
    }

    #[test]
    fn test_pulse_without_isr_is_refused() {
        let (platform, state) = platform(1).unwrap();
        let gpio = platform.gpio(0).unwrap();
        assert!(matches!(state.pulse(0), Err(Error::NoResources(_))));
        gpio.close().unwrap();
    }
}
