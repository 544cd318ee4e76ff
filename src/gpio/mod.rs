//! GPIO contexts: ownership, direction/mode/edge state, value access
//! and interrupt registration.
//!
//! A [`Gpio`] owns one line (or several, for multi-pin contexts) claimed
//! through the board's backend of record: legacy sysfs or the gpiochip
//! character device, chosen by the board's `chardev_capable` flag. Every
//! operation dispatches through the board's override table before the
//! generic implementation here runs, so a platform can replace or wrap
//! any primitive (see [`crate::overrides`]).
//!
//! Contexts are not thread-safe against concurrent mutation from several
//! owner threads; they only synchronize against the single interrupt
//! thread they may spawn.

pub(crate) mod chardev;
pub mod event;
pub mod mmap;
pub(crate) mod sysfs;

use std::sync::Arc;

use crate::board::{Board, ComplexCap, PinMapping, Platform};
use crate::error::{Error, Result};
use crate::mux;
use crate::tracing::prelude::*;

pub use event::{Event, EventSource, IsrCallback};
pub use mmap::MmapRegion;

use event::IsrThread;

/// Line direction. `OutHigh`/`OutLow` configure an output and its
/// initial level in one step; once applied, the context's direction is
/// plain `Out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    #[strum(serialize = "out")]
    Out,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "out-high")]
    OutHigh,
    #[strum(serialize = "out-low")]
    OutLow,
}

impl Direction {
    pub(crate) fn from_mux_value(v: u32) -> Option<Direction> {
        match v {
            0 => Some(Direction::Out),
            1 => Some(Direction::In),
            2 => Some(Direction::OutHigh),
            3 => Some(Direction::OutLow),
            _ => None,
        }
    }

    fn normalized(self) -> Direction {
        match self {
            Direction::OutHigh | Direction::OutLow => Direction::Out,
            other => other,
        }
    }
}

/// Output/termination mode, orthogonal to direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Mode {
    #[strum(serialize = "strong")]
    Strong,
    #[strum(serialize = "pullup")]
    Pullup,
    #[strum(serialize = "pulldown")]
    Pulldown,
    #[strum(serialize = "hiz")]
    Hiz,
    #[strum(serialize = "active_low")]
    ActiveLow,
    #[strum(serialize = "open_drain")]
    OpenDrain,
    #[strum(serialize = "open_source")]
    OpenSource,
}

impl Mode {
    pub(crate) fn from_mux_value(v: u32) -> Option<Mode> {
        match v {
            0 => Some(Mode::Strong),
            1 => Some(Mode::Pullup),
            2 => Some(Mode::Pulldown),
            3 => Some(Mode::Hiz),
            4 => Some(Mode::ActiveLow),
            5 => Some(Mode::OpenDrain),
            6 => Some(Mode::OpenSource),
            _ => None,
        }
    }
}

/// Edge sensitivity for interrupts and events. The `Display` tokens are
/// the sysfs `edge` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Edge {
    None,
    Rising,
    Falling,
    Both,
}

/// Logic level of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Level {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        level == Level::High
    }
}

/// Output driver configuration. No generic implementation exists; only
/// platforms with an override support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutDriverMode {
    PushPull,
    OpenDrain,
}

pub(crate) enum LineHandle {
    Sysfs(sysfs::SysfsLine),
    Chardev(chardev::ChardevLine),
}

impl LineHandle {
    fn raw_line(&self) -> u32 {
        match self {
            LineHandle::Sysfs(l) => l.line(),
            LineHandle::Chardev(l) => l.line(),
        }
    }

    fn set_direction(&mut self, dir: Direction) -> Result<()> {
        match self {
            LineHandle::Sysfs(l) => l.set_direction(dir),
            LineHandle::Chardev(l) => l.set_direction(dir),
        }
    }

    fn direction(&self) -> Result<Direction> {
        match self {
            LineHandle::Sysfs(l) => l.direction(),
            LineHandle::Chardev(l) => Ok(l.direction()),
        }
    }

    fn read(&mut self) -> Result<Level> {
        match self {
            LineHandle::Sysfs(l) => l.read(),
            LineHandle::Chardev(l) => l.read(),
        }
    }

    fn write(&mut self, level: Level) -> Result<()> {
        match self {
            LineHandle::Sysfs(l) => l.write(level),
            LineHandle::Chardev(l) => l.write(level),
        }
    }

    fn set_edge(&mut self, edge: Edge) -> Result<()> {
        match self {
            LineHandle::Sysfs(l) => l.set_edge(edge),
            LineHandle::Chardev(l) => {
                if edge == Edge::None {
                    l.clear_events()
                } else {
                    // The event request itself is made when an interrupt
                    // thread or event poll needs the descriptor.
                    Ok(())
                }
            }
        }
    }

    fn event_source(&mut self, edge: Edge) -> Result<EventSource> {
        match self {
            LineHandle::Sysfs(l) => Ok(EventSource::priority(l.event_file()?)),
            LineHandle::Chardev(l) => Ok(EventSource::records(
                l.request_events(edge)?,
                chardev::ChardevLine::event_record_size(),
            )),
        }
    }

    fn adopted(&self) -> bool {
        match self {
            LineHandle::Sysfs(l) => !l.exported_here(),
            LineHandle::Chardev(_) => false,
        }
    }
}

/// Fast-path accessors a platform installs when memory-mapped register
/// access is enabled on a context.
pub struct MmapAccess {
    pub region: Arc<MmapRegion>,
    /// Read the level of a raw line from the mapped bank.
    pub read: fn(&MmapRegion, u32) -> Result<Level>,
    /// Drive a raw line through the mapped bank.
    pub write: fn(&MmapRegion, u32, Level) -> Result<()>,
}

/// A GPIO context.
pub struct Gpio {
    board: Arc<Board>,
    /// Logical pin indices as supplied by the caller; empty for raw
    /// contexts.
    logical_pins: Vec<usize>,
    /// Mappings this context was opened with; consumed by the generic
    /// init, left in place for `init` replace hooks to inspect.
    init_mappings: Vec<PinMapping>,
    lines: Vec<LineHandle>,
    complex: Vec<ComplexCap>,
    num_pins: usize,
    direction: Option<Direction>,
    mode: Option<Mode>,
    edge: Edge,
    owner: bool,
    mmap: Option<MmapAccess>,
    isr: Option<IsrThread>,
    staged_callback: Option<IsrCallback>,
    closed: bool,
}

impl std::fmt::Debug for Gpio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpio")
            .field("logical_pins", &self.logical_pins)
            .field("num_pins", &self.num_pins)
            .field("direction", &self.direction)
            .field("mode", &self.mode)
            .field("edge", &self.edge)
            .field("owner", &self.owner)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Platform {
    /// Open a GPIO context on a logical pin.
    pub fn gpio(&self, pin: usize) -> Result<Gpio> {
        let (board, _local, rec) = self.pin_record(pin)?;
        if !rec.caps.gpio {
            return Err(Error::FeatureNotSupported(format!(
                "pin {pin} ({}) has no gpio capability",
                rec.name
            )));
        }
        let mapping = rec
            .gpio
            .clone()
            .ok_or_else(|| Error::Unspecified(format!("pin {pin} lacks a gpio mapping")))?;
        Gpio::open(Arc::clone(board), vec![pin], vec![mapping])
    }

    /// Open a GPIO context by pin name.
    pub fn gpio_by_name(&self, name: &str) -> Result<Gpio> {
        let pin = self
            .pin_index_by_name(name)
            .ok_or_else(|| Error::InvalidParameter(format!("no pin named {name:?}")))?;
        self.gpio(pin)
    }

    /// Open a GPIO context on a raw line number, bypassing the board's
    /// pin table (no capability check, no mux).
    pub fn gpio_raw(&self, line: u32) -> Result<Gpio> {
        Gpio::open_raw_on_board(self.primary()?, line)
    }

    /// Open one context over several logical pins. Reads, writes and
    /// events preserve the ordering of `pins`.
    pub fn gpio_multi(&self, pins: &[usize]) -> Result<Gpio> {
        if pins.is_empty() {
            return Err(Error::InvalidParameter("empty pin list".into()));
        }
        let (first_board, _, _) = self.pin_record(pins[0])?;
        let first_board = Arc::clone(first_board);
        let mut mappings = Vec::with_capacity(pins.len());
        for &pin in pins {
            let (board, _local, rec) = self.pin_record(pin)?;
            if !Arc::ptr_eq(board, &first_board) {
                return Err(Error::InvalidParameter(format!(
                    "pin {pin} is on a different platform segment than pin {}",
                    pins[0]
                )));
            }
            if !rec.caps.gpio {
                return Err(Error::FeatureNotSupported(format!(
                    "pin {pin} ({}) has no gpio capability",
                    rec.name
                )));
            }
            mappings.push(
                rec.gpio
                    .clone()
                    .ok_or_else(|| Error::Unspecified(format!("pin {pin} lacks a gpio mapping")))?,
            );
        }
        Gpio::open(first_board, pins.to_vec(), mappings)
    }
}

impl Gpio {
    fn skeleton(board: Arc<Board>, logical_pins: Vec<usize>, mappings: Vec<PinMapping>) -> Gpio {
        let num_pins = mappings.len();
        Gpio {
            board,
            logical_pins,
            init_mappings: mappings,
            lines: Vec::new(),
            complex: Vec::new(),
            num_pins,
            direction: None,
            mode: None,
            edge: Edge::None,
            owner: true,
            mmap: None,
            isr: None,
            staged_callback: None,
            closed: false,
        }
    }

    fn open(board: Arc<Board>, logical_pins: Vec<usize>, mappings: Vec<PinMapping>) -> Result<Gpio> {
        let mut ctx = Gpio::skeleton(board, logical_pins, mappings);
        let hook = ctx.board.overrides.gpio.init;
        hook.run(&mut ctx, (), |ctx, ()| ctx.generic_init())?;
        Ok(ctx)
    }

    /// Open a context on a raw line of a specific board segment. Used by
    /// the mux sequencer for auxiliary pins and by [`Platform::gpio_raw`].
    pub(crate) fn open_raw_on_board(board: &Arc<Board>, line: u32) -> Result<Gpio> {
        let mut ctx = Gpio::skeleton(Arc::clone(board), Vec::new(), vec![PinMapping::raw(line)]);
        let hook = ctx.board.overrides.gpio.init;
        hook.run(&mut ctx, (), |ctx, ()| ctx.generic_init())?;
        Ok(ctx)
    }

    /// Mappings this context was opened with, for `init` replace hooks.
    pub fn init_mappings(&self) -> &[PinMapping] {
        &self.init_mappings
    }

    fn generic_init(&mut self) -> Result<()> {
        let mappings = std::mem::take(&mut self.init_mappings);
        for mapping in &mappings {
            mux::apply(&self.board, mapping)?;
            let line = self.open_line(mapping)?;
            self.lines.push(line);
            self.complex.push(mapping.complex);
        }
        if self.lines.iter().any(LineHandle::adopted) {
            // We did not export it, so we do not unexport it.
            self.owner = false;
        }
        debug!(
            pins = ?self.logical_pins,
            lines = ?self.lines.iter().map(LineHandle::raw_line).collect::<Vec<_>>(),
            owner = self.owner,
            "gpio context ready"
        );
        Ok(())
    }

    fn open_line(&self, mapping: &PinMapping) -> Result<LineHandle> {
        if self.board.chardev_capable {
            if let Some(addr) = mapping.chardev {
                return Ok(LineHandle::Chardev(chardev::ChardevLine::open(
                    &self.board.fs.dev,
                    addr.chip,
                    addr.line,
                )?));
            }
        }
        Ok(LineHandle::Sysfs(sysfs::SysfsLine::export(
            &self.board.fs.sysfs_gpio,
            mapping.pinmap,
        )?))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidHandle("gpio context closed"));
        }
        Ok(())
    }

    /// Set the line direction. Idempotent: requesting the direction the
    /// context already has succeeds and changes nothing else. Switching
    /// direction does not stop a running ISR.
    pub fn set_dir(&mut self, dir: Direction) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.dir;
        hook.run(self, dir, |ctx, dir| {
            for line in &mut ctx.lines {
                line.set_direction(dir)?;
            }
            ctx.direction = Some(dir.normalized());
            Ok(())
        })
    }

    /// Direction as reported by the backend.
    pub fn dir(&mut self) -> Result<Direction> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.read_dir;
        hook.run(self, (), |ctx, ()| {
            let line = ctx
                .lines
                .first()
                .ok_or(Error::InvalidHandle("context has no lines"))?;
            let dir = line.direction()?;
            ctx.direction = Some(dir);
            Ok(dir)
        })
    }

    /// Set the pin mode. Pull modes need a pull-enable pin on the pin's
    /// record; without one the request fails with `FeatureNotSupported`
    /// and the context's mode is left unchanged.
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.mode;
        hook.run(self, mode, |ctx, mode| ctx.generic_mode(mode))
    }

    fn generic_mode(&mut self, mode: Mode) -> Result<()> {
        match mode {
            Mode::ActiveLow => {
                for line in &mut self.lines {
                    match line {
                        LineHandle::Sysfs(l) => l.set_active_low(true)?,
                        LineHandle::Chardev(l) => l.set_mode(Mode::ActiveLow)?,
                    }
                }
            }
            Mode::OpenDrain | Mode::OpenSource => {
                for line in &mut self.lines {
                    match line {
                        LineHandle::Sysfs(l) => {
                            return Err(Error::FeatureNotSupported(format!(
                                "mode {mode} on sysfs line {}",
                                l.line()
                            )))
                        }
                        LineHandle::Chardev(l) => l.set_mode(mode)?,
                    }
                }
            }
            Mode::Strong | Mode::Hiz => {
                for line in &mut self.lines {
                    match line {
                        LineHandle::Sysfs(l) => l.set_drive(&mode.to_string())?,
                        LineHandle::Chardev(l) => l.set_mode(mode)?,
                    }
                }
            }
            Mode::Pullup | Mode::Pulldown => {
                for idx in 0..self.lines.len() {
                    let pull_enable = self.complex.get(idx).and_then(|c| c.pull_enable);
                    let Some(aux) = pull_enable else {
                        return Err(Error::FeatureNotSupported(format!(
                            "pin {} has no pull-enable line",
                            self.lines[idx].raw_line()
                        )));
                    };
                    let mut enable = Gpio::open_raw_on_board(&self.board, aux)?;
                    enable.set_owner(false)?;
                    enable.set_dir(Direction::Out)?;
                    enable.write(Level::from(mode == Mode::Pullup))?;
                    enable.close()?;
                }
            }
        }
        self.mode = Some(mode);
        Ok(())
    }

    /// Configure edge sensitivity for interrupts and events.
    pub fn set_edge(&mut self, edge: Edge) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.edge_mode;
        hook.run(self, edge, |ctx, edge| {
            for line in &mut ctx.lines {
                line.set_edge(edge)?;
            }
            ctx.edge = edge;
            Ok(())
        })
    }

    /// Read the line level.
    pub fn read(&mut self) -> Result<Level> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.read;
        hook.run(self, 0, |ctx, pos| ctx.generic_read(pos))
    }

    fn generic_read(&mut self, pos: usize) -> Result<Level> {
        if let Some(access) = &self.mmap {
            let raw = self
                .lines
                .get(pos)
                .ok_or(Error::InvalidHandle("line position out of range"))?
                .raw_line();
            return (access.read)(&access.region, raw);
        }
        self.lines
            .get_mut(pos)
            .ok_or(Error::InvalidHandle("line position out of range"))?
            .read()
    }

    /// Drive the line.
    pub fn write(&mut self, level: Level) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.write;
        hook.run(self, (0, level), |ctx, (pos, level)| {
            ctx.generic_write(pos, level)
        })
    }

    fn generic_write(&mut self, pos: usize, level: Level) -> Result<()> {
        if let Some(access) = &self.mmap {
            let raw = self
                .lines
                .get(pos)
                .ok_or(Error::InvalidHandle("line position out of range"))?
                .raw_line();
            return (access.write)(&access.region, raw, level);
        }
        self.lines
            .get_mut(pos)
            .ok_or(Error::InvalidHandle("line position out of range"))?
            .write(level)
    }

    /// Read every line of a multi-pin context. `out` must be exactly as
    /// long as the pin array given at open time; results land in that
    /// same order.
    pub fn read_multi(&mut self, out: &mut [Level]) -> Result<()> {
        self.ensure_open()?;
        if out.len() != self.num_pins {
            return Err(Error::InvalidParameter(format!(
                "output array holds {} slots, context has {} pins",
                out.len(),
                self.num_pins
            )));
        }
        let hook = self.board.overrides.gpio.read;
        for (pos, slot) in out.iter_mut().enumerate() {
            *slot = hook.run(self, pos, |ctx, pos| ctx.generic_read(pos))?;
        }
        Ok(())
    }

    /// Write every line of a multi-pin context. `values` must be exactly
    /// as long as the pin array given at open time.
    pub fn write_multi(&mut self, values: &[Level]) -> Result<()> {
        self.ensure_open()?;
        if values.len() != self.num_pins {
            return Err(Error::InvalidParameter(format!(
                "value array holds {} entries, context has {} pins",
                values.len(),
                self.num_pins
            )));
        }
        let hook = self.board.overrides.gpio.write;
        for (pos, &level) in values.iter().enumerate() {
            hook.run(self, (pos, level), |ctx, (pos, level)| {
                ctx.generic_write(pos, level)
            })?;
        }
        Ok(())
    }

    /// Register an edge-triggered interrupt callback.
    ///
    /// At most one ISR per context: a second registration fails with
    /// `NoResources` until [`Gpio::isr_exit`] runs. The callback is
    /// invoked on a background thread, concurrently with the caller's
    /// code. If the event source fails after registration, the thread
    /// exits silently and a later `set_isr` may retry.
    pub fn set_isr(
        &mut self,
        edge: Edge,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<()> {
        self.ensure_open()?;
        match self.isr.take() {
            // The thread exited on an event-source failure; reap it so
            // this registration can retry.
            Some(thread) if thread.is_dead() => {
                let _ = thread.stop();
            }
            Some(thread) => {
                self.isr = Some(thread);
                return Err(Error::NoResources(
                    "an isr is already registered on this context".into(),
                ));
            }
            None => {}
        }
        self.staged_callback = Some(Box::new(callback));
        let hook = self.board.overrides.gpio.isr;
        let result = hook.run(self, edge, |ctx, edge| ctx.generic_isr(edge));
        self.staged_callback = None;
        result
    }

    fn generic_isr(&mut self, edge: Edge) -> Result<()> {
        self.set_edge(edge)?;
        let source = self
            .lines
            .first_mut()
            .ok_or(Error::InvalidHandle("context has no lines"))?
            .event_source(edge)?;
        self.attach_isr_source(source)
    }

    /// Spawn the interrupt thread over a platform-supplied event source.
    ///
    /// Intended for `isr` replace hooks: the staged callback of the
    /// in-flight [`Gpio::set_isr`] call is attached to `source` using the
    /// same thread and cancellation machinery as the generic path.
    pub fn attach_isr_source(&mut self, source: EventSource) -> Result<()> {
        if self.isr.is_some() {
            return Err(Error::NoResources(
                "an isr is already registered on this context".into(),
            ));
        }
        let callback = self
            .staged_callback
            .take()
            .ok_or(Error::InvalidHandle("no isr callback staged"))?;
        self.isr = Some(IsrThread::spawn(source, callback)?);
        trace!(pins = ?self.logical_pins, "isr thread attached");
        Ok(())
    }

    /// Stop the interrupt thread, blocking until it has exited, then
    /// reset the edge mode to `None`.
    ///
    /// Idempotent: calling with no ISR registered succeeds. There is no
    /// timeout; a descriptor that never wakes from poll would block the
    /// caller indefinitely, which is the documented contract.
    pub fn isr_exit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.isr_exit;
        hook.run(self, (), |ctx, ()| ctx.generic_isr_exit())
    }

    fn generic_isr_exit(&mut self) -> Result<()> {
        match self.isr.take() {
            None => Ok(()),
            Some(thread) => {
                thread.stop()?;
                self.set_edge(Edge::None)
            }
        }
    }

    /// Block until at least one line of a multi-pin context delivers an
    /// edge event, then report per-line results in the pin order given
    /// at open time; lines with no event this wakeup yield `None`.
    ///
    /// Requires chardev lines with a non-`None` edge configured.
    pub fn events(&mut self) -> Result<Vec<Option<Event>>> {
        use std::os::fd::AsFd;

        self.ensure_open()?;
        if self.edge == Edge::None {
            return Err(Error::InvalidParameter(
                "edge mode must be configured before polling events".into(),
            ));
        }

        // Make sure every line has an event request.
        let edge = self.edge;
        for line in &mut self.lines {
            match line {
                LineHandle::Chardev(l) => {
                    if l.event_file().is_none() {
                        let _ = l.request_events(edge)?;
                    }
                }
                LineHandle::Sysfs(l) => {
                    return Err(Error::FeatureNotSupported(format!(
                        "event polling on sysfs line {}",
                        l.line()
                    )))
                }
            }
        }

        let ready: Vec<bool> = {
            let mut fds = Vec::with_capacity(self.lines.len());
            for line in &self.lines {
                let LineHandle::Chardev(l) = line else {
                    unreachable!("checked above");
                };
                let file = l.event_file().ok_or(Error::InvalidHandle("event fd vanished"))?;
                fds.push(nix::poll::PollFd::new(
                    file.as_fd(),
                    nix::poll::PollFlags::POLLIN,
                ));
            }
            loop {
                match nix::poll::poll(&mut fds, nix::poll::PollTimeout::NONE) {
                    Ok(_) => break,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::Unspecified(format!("event poll failed: {e}")));
                    }
                }
            }
            fds.iter()
                .map(|fd| {
                    fd.revents()
                        .map(|r| r.contains(nix::poll::PollFlags::POLLIN))
                        .unwrap_or(false)
                })
                .collect()
        };

        let mut events = Vec::with_capacity(self.lines.len());
        for (line, ready) in self.lines.iter_mut().zip(ready) {
            if !ready {
                events.push(None);
                continue;
            }
            let LineHandle::Chardev(l) = line else {
                unreachable!("checked above");
            };
            events.push(Some(l.read_event()?));
        }
        Ok(events)
    }

    /// Change whether this context releases the line on close.
    pub fn set_owner(&mut self, owner: bool) -> Result<()> {
        self.ensure_open()?;
        self.owner = owner;
        Ok(())
    }

    /// Logical pin this context was opened on; `None` for raw contexts.
    pub fn pin(&self) -> Option<usize> {
        self.logical_pins.first().copied()
    }

    /// Raw kernel line number of the context's first line.
    pub fn pin_raw(&self) -> Option<u32> {
        self.lines
            .first()
            .map(LineHandle::raw_line)
            .or_else(|| self.init_mappings.first().map(|m| m.pinmap))
    }

    /// Number of pins in this context.
    pub fn pin_count(&self) -> usize {
        self.num_pins
    }

    /// Last successfully applied mode, if any.
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Configured edge sensitivity.
    pub fn edge(&self) -> Edge {
        self.edge
    }

    /// Whether this context releases its lines on close.
    pub fn owner(&self) -> bool {
        self.owner
    }

    /// Enable or disable the memory-mapped fast path.
    ///
    /// Enabling twice, or disabling when not enabled, is an error: the
    /// mapped bank is a shared, reference-counted region and the
    /// enable/disable calls must stay balanced.
    pub fn set_mmap(&mut self, enable: bool) -> Result<()> {
        self.ensure_open()?;
        if enable && self.mmap.is_some() {
            return Err(Error::InvalidParameter("mmap already enabled".into()));
        }
        if !enable && self.mmap.is_none() {
            return Err(Error::InvalidParameter("mmap not enabled".into()));
        }
        let hook = self.board.overrides.gpio.mmap_setup;
        hook.run(self, enable, |_ctx, _enable| {
            Err(Error::FeatureNotSupported(
                "no memory-mapped gpio path on this platform".into(),
            ))
        })
    }

    /// Install fast-path accessors. For `mmap_setup` replace hooks.
    pub fn install_mmap(&mut self, access: MmapAccess) -> Result<()> {
        if self.mmap.is_some() {
            return Err(Error::InvalidParameter("mmap already enabled".into()));
        }
        self.mmap = Some(access);
        Ok(())
    }

    /// Remove fast-path accessors, dropping the region reference. For
    /// `mmap_setup` replace hooks.
    pub fn clear_mmap(&mut self) -> Result<()> {
        self.mmap
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::InvalidParameter("mmap not enabled".into()))
    }

    /// Configure the output driver. Only available through a platform
    /// override.
    pub fn set_out_driver_mode(&mut self, mode: OutDriverMode) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.gpio.out_driver_mode;
        hook.run(self, mode, |_ctx, _mode| {
            Err(Error::FeatureNotImplemented("gpio out driver mode"))
        })
    }

    /// Close the context: stop any interrupt thread, then release the
    /// lines. A context that owns its lines unexports them; a borrowed
    /// context leaves them exported.
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let hook = self.board.overrides.gpio.close;
        let result = hook.run(self, (), |ctx, ()| ctx.generic_close());
        self.closed = true;
        result
    }

    fn generic_close(&mut self) -> Result<()> {
        self.isr_exit()?;
        if self.owner {
            for line in &self.lines {
                if let LineHandle::Sysfs(l) = line {
                    l.unexport()?;
                }
            }
        }
        self.lines.clear();
        self.mmap = None;
        debug!(pins = ?self.logical_pins, owner = self.owner, "gpio context closed");
        Ok(())
    }

    /// The board this context belongs to.
    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }
}

impl Drop for Gpio {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_mut() {
                warn!(error = %e, "gpio context leaked resources on drop");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::board::{Capabilities, PinRecord};
    use std::fs;
    use std::path::Path;

    pub(crate) fn fake_sysfs(lines: &[u32]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        fs::write(dir.path().join("unexport"), "").unwrap();
        for line in lines {
            add_fake_line(dir.path(), *line);
        }
        dir
    }

    pub(crate) fn add_fake_line(root: &Path, line: u32) {
        let pin_dir = root.join(format!("gpio{line}"));
        fs::create_dir(&pin_dir).unwrap();
        fs::write(pin_dir.join("direction"), "in").unwrap();
        fs::write(pin_dir.join("value"), "0").unwrap();
        fs::write(pin_dir.join("edge"), "none").unwrap();
        fs::write(pin_dir.join("active_low"), "0").unwrap();
    }

    pub(crate) fn sysfs_board(root: &Path, raw_lines: &[u32]) -> crate::board::Board {
        let pins = raw_lines
            .iter()
            .map(|&line| PinRecord {
                name: format!("IO{line}"),
                caps: Capabilities::gpio(),
                gpio: Some(PinMapping::raw(line)),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let count = pins.len();
        let mut fs_layout = crate::board::FsLayout::default();
        fs_layout.sysfs_gpio = root.to_path_buf();
        crate::board::Board::builder("sysfs-test")
            .pins(pins)
            .gpio_count(count)
            .fs_layout(fs_layout)
            .build()
            .unwrap()
    }

    fn value_of(root: &Path, line: u32) -> String {
        fs::read_to_string(root.join(format!("gpio{line}")).join("value")).unwrap()
    }

    #[test]
    fn test_direction_is_idempotent() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();

        gpio.set_dir(Direction::Out).unwrap();
        gpio.set_dir(Direction::Out).unwrap();
        assert_eq!(gpio.dir().unwrap(), Direction::Out);

        gpio.set_dir(Direction::In).unwrap();
        gpio.set_dir(Direction::In).unwrap();
        assert_eq!(gpio.dir().unwrap(), Direction::In);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();
        gpio.set_dir(Direction::Out).unwrap();

        gpio.write(Level::High).unwrap();
        assert_eq!(gpio.read().unwrap(), Level::High);
        assert_eq!(value_of(root.path(), 4), "1");

        gpio.write(Level::Low).unwrap();
        assert_eq!(gpio.read().unwrap(), Level::Low);
    }

    #[test]
    fn test_multi_length_mismatch_is_rejected_without_io() {
        let root = fake_sysfs(&[3, 5]);
        let platform = Platform::new(sysfs_board(root.path(), &[3, 5]));
        let mut gpio = platform.gpio_multi(&[0, 1]).unwrap();
        gpio.set_dir(Direction::Out).unwrap();

        let err = gpio.write_multi(&[Level::High]).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        // No partial write happened.
        assert_eq!(value_of(root.path(), 3), "0");
        assert_eq!(value_of(root.path(), 5), "0");

        let mut out = [Level::Low; 3];
        assert!(matches!(
            gpio.read_multi(&mut out),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_multi_preserves_caller_order() {
        let root = fake_sysfs(&[3, 5]);
        let platform = Platform::new(sysfs_board(root.path(), &[3, 5]));
        // Open in reverse order relative to the board table.
        let mut gpio = platform.gpio_multi(&[1, 0]).unwrap();
        gpio.set_dir(Direction::Out).unwrap();

        gpio.write_multi(&[Level::High, Level::Low]).unwrap();
        assert_eq!(value_of(root.path(), 5), "1");
        assert_eq!(value_of(root.path(), 3), "0");

        let mut out = [Level::Low; 2];
        gpio.read_multi(&mut out).unwrap();
        assert_eq!(out, [Level::High, Level::Low]);
    }

    #[test]
    fn test_owner_close_unexports_borrowed_close_does_not() {
        let root = fake_sysfs(&[7]);
        let platform = Platform::new(sysfs_board(root.path(), &[7]));

        let mut gpio = platform.gpio(0).unwrap();
        gpio.set_owner(false).unwrap();
        gpio.close().unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("unexport")).unwrap(),
            ""
        );

        let gpio = platform.gpio(0).unwrap();
        gpio.close().unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("unexport")).unwrap(),
            "7"
        );
    }

    #[test]
    fn test_pullup_without_pull_enable_pin_not_supported() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();

        let err = gpio.set_mode(Mode::Pullup).unwrap_err();
        assert!(matches!(err, Error::FeatureNotSupported(_)));
        assert_eq!(gpio.mode, None);
    }

    #[test]
    fn test_pullup_drives_pull_enable_pin() {
        let root = fake_sysfs(&[4, 40]);
        let mut board = sysfs_board(root.path(), &[4, 40]);
        // Pin 0's pull resistors are switched by raw line 40.
        {
            let mapping = board.pins[0].gpio.as_mut().unwrap();
            mapping.complex.pull_enable = Some(40);
        }
        let platform = Platform::new(board);
        let mut gpio = platform.gpio(0).unwrap();

        gpio.set_mode(Mode::Pullup).unwrap();
        assert_eq!(value_of(root.path(), 40), "1");
        gpio.set_mode(Mode::Pulldown).unwrap();
        assert_eq!(value_of(root.path(), 40), "0");
        // The enable context never owned line 40.
        assert_eq!(
            fs::read_to_string(root.path().join("unexport")).unwrap(),
            ""
        );
    }

    #[test]
    fn test_mmap_balance_guard() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();

        // Generic platform has no fast path.
        assert!(matches!(
            gpio.set_mmap(true),
            Err(Error::FeatureNotSupported(_))
        ));
        // Disabling something never enabled is a balance error.
        assert!(matches!(
            gpio.set_mmap(false),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_isr_exit_without_isr_is_success() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();
        gpio.isr_exit().unwrap();
        gpio.isr_exit().unwrap();
    }

    #[test]
    fn test_isr_registration_blocks_second_isr_and_exit_cancels() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();
        gpio.set_dir(Direction::In).unwrap();

        gpio.set_isr(Edge::Rising, || {}).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio4").join("edge")).unwrap(),
            "rising"
        );
        assert!(matches!(
            gpio.set_isr(Edge::Rising, || {}),
            Err(Error::NoResources(_))
        ));

        // The thread is blocked on a poll that will never fire on a
        // plain file; exit must still cancel it promptly and reset the
        // edge.
        gpio.isr_exit().unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio4").join("edge")).unwrap(),
            "none"
        );
        // And a new registration is possible again.
        gpio.set_isr(Edge::Falling, || {}).unwrap();
        gpio.isr_exit().unwrap();
    }

    #[test]
    fn test_operations_on_closed_context_fail() {
        let root = fake_sysfs(&[4]);
        let platform = Platform::new(sysfs_board(root.path(), &[4]));
        let mut gpio = platform.gpio(0).unwrap();
        gpio.close_mut().unwrap();
        assert!(matches!(gpio.read(), Err(Error::InvalidHandle(_))));
        assert!(matches!(
            gpio.set_dir(Direction::Out),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_gpio_by_name_and_pin_accessors() {
        let root = fake_sysfs(&[3, 5]);
        let platform = Platform::new(sysfs_board(root.path(), &[3, 5]));
        let gpio = platform.gpio_by_name("IO5").unwrap();
        assert_eq!(gpio.pin(), Some(1));
        assert_eq!(gpio.pin_raw(), Some(5));
        assert!(matches!(
            platform.gpio_by_name("NOPE"),
            Err(Error::InvalidParameter(_))
        ));
    }
}
