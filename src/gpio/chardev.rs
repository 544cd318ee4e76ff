//! Chardev GPIO backend (`/dev/gpiochip*`, v1 uapi).
//!
//! Lines are claimed with `GPIO_GET_LINEHANDLE_IOCTL` for value access
//! and re-requested as `GPIO_GET_LINEEVENT_IOCTL` descriptors when edge
//! events are wanted; the kernel refuses to hand out both at once for
//! the same line, so the two requests swap. Value reads work on either
//! descriptor.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use crate::error::{Error, Result};
use crate::gpio::event::Event;
use crate::gpio::{Direction, Edge, Level, Mode};
use crate::tracing::prelude::*;

const GPIOHANDLES_MAX: usize = 64;
const CONSUMER: &[u8] = b"breakout";

pub(crate) const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
pub(crate) const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
pub(crate) const GPIOHANDLE_REQUEST_ACTIVE_LOW: u32 = 1 << 2;
pub(crate) const GPIOHANDLE_REQUEST_OPEN_DRAIN: u32 = 1 << 3;
pub(crate) const GPIOHANDLE_REQUEST_OPEN_SOURCE: u32 = 1 << 4;

const GPIOEVENT_REQUEST_RISING_EDGE: u32 = 1 << 0;
const GPIOEVENT_REQUEST_FALLING_EDGE: u32 = 1 << 1;

const GPIOEVENT_EVENT_RISING_EDGE: u32 = 0x01;
const GPIOEVENT_EVENT_FALLING_EDGE: u32 = 0x02;

#[repr(C)]
pub(crate) struct GpioChipInfo {
    name: [u8; 32],
    label: [u8; 32],
    lines: u32,
}

#[repr(C)]
pub(crate) struct GpioHandleRequest {
    lineoffsets: [u32; GPIOHANDLES_MAX],
    flags: u32,
    default_values: [u8; GPIOHANDLES_MAX],
    consumer_label: [u8; 32],
    lines: u32,
    fd: libc::c_int,
}

#[repr(C)]
pub(crate) struct GpioHandleData {
    values: [u8; GPIOHANDLES_MAX],
}

#[repr(C)]
pub(crate) struct GpioEventRequest {
    lineoffset: u32,
    handleflags: u32,
    eventflags: u32,
    consumer_label: [u8; 32],
    fd: libc::c_int,
}

#[repr(C)]
pub(crate) struct GpioEventData {
    timestamp: u64,
    id: u32,
}

nix::ioctl_read!(gpio_get_chipinfo, 0xB4, 0x01, GpioChipInfo);
nix::ioctl_readwrite!(gpio_get_linehandle, 0xB4, 0x03, GpioHandleRequest);
nix::ioctl_readwrite!(gpio_get_lineevent, 0xB4, 0x04, GpioEventRequest);
nix::ioctl_readwrite!(gpiohandle_get_line_values, 0xB4, 0x08, GpioHandleData);
nix::ioctl_readwrite!(gpiohandle_set_line_values, 0xB4, 0x09, GpioHandleData);

fn consumer_label() -> [u8; 32] {
    let mut label = [0u8; 32];
    label[..CONSUMER.len()].copy_from_slice(CONSUMER);
    label
}

pub(crate) struct ChardevLine {
    chip: File,
    line: u32,
    handle: Option<OwnedFd>,
    event: Option<File>,
    /// Request flags currently applied to the line.
    flags: u32,
}

impl ChardevLine {
    pub(crate) fn open(dev_root: &Path, chip: u32, line: u32) -> Result<ChardevLine> {
        let chip_path = dev_root.join(format!("gpiochip{chip}"));
        let chip_file = File::options()
            .read(true)
            .write(true)
            .open(&chip_path)
            .map_err(|e| Error::invalid_resource(chip_path.display().to_string(), e))?;

        // SAFETY: valid chip fd, correctly sized out-struct.
        let mut info = GpioChipInfo {
            name: [0; 32],
            label: [0; 32],
            lines: 0,
        };
        unsafe { gpio_get_chipinfo(chip_file.as_raw_fd(), &mut info) }
            .map_err(|e| chardev_err(&chip_path.display().to_string(), e))?;
        if line >= info.lines {
            return Err(Error::InvalidParameter(format!(
                "line {line} out of range for {} ({} lines)",
                chip_path.display(),
                info.lines
            )));
        }

        let mut this = ChardevLine {
            chip: chip_file,
            line,
            handle: None,
            event: None,
            flags: GPIOHANDLE_REQUEST_INPUT,
        };
        this.request_handle(GPIOHANDLE_REQUEST_INPUT, 0)?;
        trace!(chip, line, "chardev line claimed");
        Ok(this)
    }

    pub(crate) fn line(&self) -> u32 {
        self.line
    }

    fn request_handle(&mut self, flags: u32, default_value: u8) -> Result<()> {
        // Drop any previous claim first; the kernel holds the line
        // busy until the old descriptor closes.
        self.handle = None;
        self.event = None;

        // SAFETY: zero-fill is a valid bit pattern for the request
        // struct; only the fields below are read by the kernel.
        let mut req: GpioHandleRequest = unsafe { std::mem::zeroed() };
        req.lineoffsets[0] = self.line;
        req.default_values[0] = default_value;
        req.consumer_label = consumer_label();
        req.flags = flags;
        req.lines = 1;

        // SAFETY: valid chip fd and request struct.
        unsafe { gpio_get_linehandle(self.chip.as_raw_fd(), &mut req) }
            .map_err(|e| chardev_err("line handle request", e))?;
        if req.fd <= 0 {
            return Err(Error::NoResources(format!(
                "kernel returned invalid line handle for line {}",
                self.line
            )));
        }
        // SAFETY: the kernel just handed us this descriptor.
        self.handle = Some(unsafe { OwnedFd::from_raw_fd(req.fd) });
        self.flags = flags;
        Ok(())
    }

    pub(crate) fn set_direction(&mut self, dir: Direction) -> Result<()> {
        let preserved = self.flags
            & (GPIOHANDLE_REQUEST_ACTIVE_LOW
                | GPIOHANDLE_REQUEST_OPEN_DRAIN
                | GPIOHANDLE_REQUEST_OPEN_SOURCE);
        let (dir_flag, default_value) = match dir {
            Direction::In => (GPIOHANDLE_REQUEST_INPUT, 0),
            Direction::Out => (GPIOHANDLE_REQUEST_OUTPUT, 0),
            Direction::OutHigh => (GPIOHANDLE_REQUEST_OUTPUT, 1),
            Direction::OutLow => (GPIOHANDLE_REQUEST_OUTPUT, 0),
        };
        self.request_handle(preserved | dir_flag, default_value)
    }

    pub(crate) fn direction(&self) -> Direction {
        if self.flags & GPIOHANDLE_REQUEST_OUTPUT != 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) -> Result<()> {
        let mut flags = self.flags;
        match mode {
            Mode::ActiveLow => flags |= GPIOHANDLE_REQUEST_ACTIVE_LOW,
            Mode::OpenDrain => flags |= GPIOHANDLE_REQUEST_OPEN_DRAIN,
            Mode::OpenSource => flags |= GPIOHANDLE_REQUEST_OPEN_SOURCE,
            Mode::Strong => {
                flags &= !(GPIOHANDLE_REQUEST_OPEN_DRAIN | GPIOHANDLE_REQUEST_OPEN_SOURCE);
            }
            Mode::Hiz | Mode::Pullup | Mode::Pulldown => {
                // v1 uapi has no bias flags; pulls need a board-level
                // pull-enable pin.
                return Err(Error::FeatureNotSupported(format!(
                    "mode {mode} on chardev line {}",
                    self.line
                )));
            }
        }
        self.request_handle(flags, 0)
    }

    fn values_fd(&self) -> Result<libc::c_int> {
        if let Some(event) = &self.event {
            return Ok(event.as_raw_fd());
        }
        self.handle
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(Error::InvalidHandle("chardev line released"))
    }

    pub(crate) fn read(&mut self) -> Result<Level> {
        // SAFETY: zeroed data struct, valid descriptor.
        let mut data: GpioHandleData = unsafe { std::mem::zeroed() };
        let fd = self.values_fd()?;
        unsafe { gpiohandle_get_line_values(fd, &mut data) }
            .map_err(|e| chardev_err("get line values", e))?;
        Ok(if data.values[0] == 0 {
            Level::Low
        } else {
            Level::High
        })
    }

    pub(crate) fn write(&mut self, level: Level) -> Result<()> {
        if self.handle.is_none() {
            // An event request displaced the handle; writing means the
            // caller wants the line driven again.
            self.request_handle(
                (self.flags & !GPIOHANDLE_REQUEST_INPUT) | GPIOHANDLE_REQUEST_OUTPUT,
                u8::from(level == Level::High),
            )?;
        }
        // SAFETY: zeroed data struct, valid descriptor.
        let mut data: GpioHandleData = unsafe { std::mem::zeroed() };
        data.values[0] = u8::from(level == Level::High);
        let fd = self.values_fd()?;
        unsafe { gpiohandle_set_line_values(fd, &mut data) }
            .map_err(|e| chardev_err("set line values", e))?;
        Ok(())
    }

    /// Swap the line's handle for an event request and return a
    /// descriptor for the interrupt thread. A second descriptor is kept
    /// on the context so value reads and [`Self::read_event`] keep
    /// working.
    pub(crate) fn request_events(&mut self, edge: Edge) -> Result<File> {
        let eventflags = match edge {
            Edge::Rising => GPIOEVENT_REQUEST_RISING_EDGE,
            Edge::Falling => GPIOEVENT_REQUEST_FALLING_EDGE,
            Edge::Both => GPIOEVENT_REQUEST_RISING_EDGE | GPIOEVENT_REQUEST_FALLING_EDGE,
            Edge::None => {
                return Err(Error::InvalidParameter(
                    "cannot request events for edge mode none".into(),
                ))
            }
        };

        self.handle = None;
        self.event = None;

        // SAFETY: zero-fill then set the fields the kernel reads.
        let mut req: GpioEventRequest = unsafe { std::mem::zeroed() };
        req.lineoffset = self.line;
        req.handleflags = GPIOHANDLE_REQUEST_INPUT
            | (self.flags
                & (GPIOHANDLE_REQUEST_ACTIVE_LOW
                    | GPIOHANDLE_REQUEST_OPEN_DRAIN
                    | GPIOHANDLE_REQUEST_OPEN_SOURCE));
        req.eventflags = eventflags;
        req.consumer_label = consumer_label();

        // SAFETY: valid chip fd and request struct.
        unsafe { gpio_get_lineevent(self.chip.as_raw_fd(), &mut req) }
            .map_err(|e| chardev_err("line event request", e))?;
        if req.fd <= 0 {
            return Err(Error::NoResources(format!(
                "kernel returned invalid event descriptor for line {}",
                self.line
            )));
        }
        // SAFETY: the kernel just handed us this descriptor.
        let event = unsafe { File::from_raw_fd(req.fd) };
        let thread_copy = event
            .try_clone()
            .map_err(|e| Error::NoResources(format!("dup event fd: {e}")))?;
        self.event = Some(event);
        debug!(line = self.line, edge = %edge, "line-event request active");
        Ok(thread_copy)
    }

    /// Size of one kernel event record.
    pub(crate) fn event_record_size() -> usize {
        std::mem::size_of::<GpioEventData>()
    }

    pub(crate) fn event_file(&self) -> Option<&File> {
        self.event.as_ref()
    }

    /// Read one pending event record. Call only after poll reported the
    /// event descriptor readable.
    pub(crate) fn read_event(&mut self) -> Result<Event> {
        let event = self
            .event
            .as_mut()
            .ok_or(Error::InvalidHandle("no event request on line"))?;
        let mut buf = vec![0u8; Self::event_record_size()];
        let n = event
            .read(&mut buf)
            .map_err(|e| Error::invalid_resource(format!("line {} event", self.line), e))?;
        if n < Self::event_record_size() {
            return Err(Error::Unspecified(format!(
                "short event read on line {}: {n} bytes",
                self.line
            )));
        }
        // SAFETY: the kernel wrote a full record into buf.
        let data: GpioEventData = unsafe { std::ptr::read(buf.as_ptr().cast()) };
        let edge = match data.id {
            GPIOEVENT_EVENT_RISING_EDGE => Edge::Rising,
            GPIOEVENT_EVENT_FALLING_EDGE => Edge::Falling,
            other => {
                return Err(Error::Unspecified(format!(
                    "unknown event id {other} on line {}",
                    self.line
                )))
            }
        };
        Ok(Event {
            edge,
            timestamp_ns: data.timestamp,
        })
    }

    /// Drop the event request, reverting to a plain input handle.
    pub(crate) fn clear_events(&mut self) -> Result<()> {
        if self.event.is_some() {
            let preserved = self.flags & !GPIOHANDLE_REQUEST_OUTPUT;
            self.request_handle(preserved | GPIOHANDLE_REQUEST_INPUT, 0)?;
        }
        Ok(())
    }
}

fn chardev_err(what: &str, errno: nix::errno::Errno) -> Error {
    Error::invalid_resource(what.to_string(), std::io::Error::from_raw_os_error(errno as i32))
}
