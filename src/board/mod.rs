//! Board descriptions: pin tables, capabilities, mux chains and bus
//! definitions.
//!
//! A board module is a collaborator of this crate: it supplies a pin
//! table mapping logical pin numbers to physical sysfs numbers or
//! chardev (chip, line) pairs, per-bus count tables, and an optional
//! override table replacing or wrapping any generic operation. All of it
//! is immutable once [`BoardBuilder::build`] has run; contexts share the
//! result through an `Arc`.
//!
//! Platforms that extend a base board's pin namespace (USB bridges,
//! shield boards) are stacked as additional segments on a [`Platform`];
//! logical pin indices resolve to a segment by range lookup.

pub mod mock;

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::overrides::OverrideTable;

/// Maximum number of mux steps a single pin mapping may carry.
pub const MAX_MUX_STEPS: usize = 6;

/// Capability flags for one pin, fixed at board-definition time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub valid: bool,
    pub gpio: bool,
    pub pwm: bool,
    pub fast_gpio: bool,
    pub spi: bool,
    pub i2c: bool,
    pub aio: bool,
    pub uart: bool,
}

impl Capabilities {
    /// A plain GPIO-only pin.
    pub fn gpio() -> Self {
        Capabilities {
            valid: true,
            gpio: true,
            ..Default::default()
        }
    }
}

/// One auxiliary-GPIO operation in a pin's mux chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxCmd {
    /// Write `value` to the line; the line must already be an output.
    SetValue,
    /// Set the line direction; `value` encodes a [`crate::gpio::Direction`].
    SetDirection,
    /// Set direction to input, then write `value`.
    SetInValue,
    /// Set direction to output, then write `value`.
    SetOutValue,
    /// Apply a [`crate::gpio::Mode`] encoded in `value`.
    SetMode,
    /// Unused slot in a fixed-arity mux table.
    Skip,
}

/// A single step of a mux chain. Steps set absolute state, so applying a
/// chain twice is idempotent.
#[derive(Debug, Clone, Copy)]
pub struct MuxStep {
    /// Auxiliary pin, addressed as a raw line number. Aux pins are never
    /// themselves mux'd; chains do not nest.
    pub pin: u32,
    pub cmd: MuxCmd,
    pub value: u32,
}

/// Auxiliary control pins for "complex" capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexCap {
    /// Raw line driving the output-enable buffer, if the pin has one.
    pub output_enable: Option<u32>,
    /// Polarity of the output-enable line (`true` = enable is high).
    pub output_enable_high: bool,
    /// Raw line driving the pull-up/pull-down enable, if the pin has one.
    pub pull_enable: Option<u32>,
}

/// Chardev address of a line: which `/dev/gpiochip<N>` and which offset
/// on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChardevAddr {
    pub chip: u32,
    pub line: u32,
}

/// Physical mapping of one capability of one pin.
#[derive(Debug, Clone, Default)]
pub struct PinMapping {
    /// Raw pin/line/bus/channel number as the kernel knows it.
    pub pinmap: u32,
    /// Parent resource (pwm chip id, spi bus id) when the capability is
    /// addressed as (parent, pinmap).
    pub parent: Option<u32>,
    /// Chardev address, for boards exposing the line through a gpiochip.
    pub chardev: Option<ChardevAddr>,
    /// Mux steps applied, in order, before the capability is usable.
    pub mux: Vec<MuxStep>,
    pub complex: ComplexCap,
}

impl PinMapping {
    /// Mapping with a raw number and nothing else.
    pub fn raw(pinmap: u32) -> Self {
        PinMapping {
            pinmap,
            ..Default::default()
        }
    }
}

/// Descriptor of one logical pin. Owned by the board table; never
/// mutated after board construction.
#[derive(Debug, Clone, Default)]
pub struct PinRecord {
    pub name: String,
    pub caps: Capabilities,
    pub gpio: Option<PinMapping>,
    pub pwm: Option<PinMapping>,
    pub spi: Option<PinMapping>,
    pub i2c: Option<PinMapping>,
    pub aio: Option<PinMapping>,
    pub uart: Option<PinMapping>,
}

/// An I2C bus exposed on the pin header.
#[derive(Debug, Clone, Copy)]
pub struct I2cBusDef {
    /// Kernel bus id (`/dev/i2c-<bus_id>`).
    pub bus_id: u32,
    /// Logical pin indices of the data and clock lines.
    pub sda: usize,
    pub scl: usize,
}

/// An SPI bus exposed on the pin header.
#[derive(Debug, Clone, Copy)]
pub struct SpiBusDef {
    /// Kernel bus id (`/dev/spidev<bus_id>.<cs>`).
    pub bus_id: u32,
    pub cs: u32,
    /// Logical pin indices participating in the bus, used for muxing.
    pub sclk: Option<usize>,
    pub mosi: Option<usize>,
    pub miso: Option<usize>,
}

/// A UART device exposed on the pin header.
#[derive(Debug, Clone)]
pub struct UartDevDef {
    pub rx: Option<usize>,
    pub tx: Option<usize>,
    /// Kernel device path, e.g. `/dev/ttyS0`.
    pub device_path: PathBuf,
}

/// Filesystem roots the generic implementations talk to. Boards backed
/// by bridges, and tests, point these somewhere else.
#[derive(Debug, Clone)]
pub struct FsLayout {
    /// Legacy sysfs GPIO class directory.
    pub sysfs_gpio: PathBuf,
    /// Directory holding `gpiochip*`, `i2c-*`, `spidev*` device nodes.
    pub dev: PathBuf,
    /// PWM chip class directory.
    pub pwm: PathBuf,
    /// IIO device directory for analog inputs.
    pub iio: PathBuf,
}

impl Default for FsLayout {
    fn default() -> Self {
        FsLayout {
            sysfs_gpio: PathBuf::from("/sys/class/gpio"),
            dev: PathBuf::from("/dev"),
            pwm: PathBuf::from("/sys/class/pwm"),
            iio: PathBuf::from("/sys/bus/iio/devices"),
        }
    }
}

/// One platform segment: pin table, bus tables, override table.
///
/// Immutable after construction. The consistency checks between bus
/// counts and capability-marked pins run in [`BoardBuilder::build`];
/// the operating core trusts the result.
pub struct Board {
    pub name: String,
    pub pins: Vec<PinRecord>,
    pub gpio_count: usize,
    pub aio_count: usize,
    pub i2c_buses: Vec<I2cBusDef>,
    pub def_i2c_bus: usize,
    pub spi_buses: Vec<SpiBusDef>,
    pub def_spi_bus: usize,
    pub uart_devs: Vec<UartDevDef>,
    pub def_uart_dev: usize,
    pub pwm_dev_count: usize,
    /// Whether the generic GPIO implementation should use the gpiochip
    /// character device instead of legacy sysfs.
    pub chardev_capable: bool,
    pub overrides: OverrideTable,
    pub fs: FsLayout,
    /// Platform-private state reachable from override hooks through a
    /// context's board handle.
    pub platform_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.name)
            .field("pins", &self.pins.len())
            .field("chardev_capable", &self.chardev_capable)
            .finish_non_exhaustive()
    }
}

impl Board {
    pub fn builder(name: impl Into<String>) -> BoardBuilder {
        BoardBuilder {
            board: Board {
                name: name.into(),
                pins: Vec::new(),
                gpio_count: 0,
                aio_count: 0,
                i2c_buses: Vec::new(),
                def_i2c_bus: 0,
                spi_buses: Vec::new(),
                def_spi_bus: 0,
                uart_devs: Vec::new(),
                def_uart_dev: 0,
                pwm_dev_count: 0,
                chardev_capable: false,
                overrides: OverrideTable::default(),
                fs: FsLayout::default(),
                platform_data: None,
            },
        }
    }

    /// Number of physical pins in this segment's table.
    pub fn phy_pin_count(&self) -> usize {
        self.pins.len()
    }

    /// First pin index whose record carries the given name.
    pub fn pin_index_by_name(&self, name: &str) -> Option<usize> {
        self.pins.iter().position(|p| p.name == name)
    }

    pub(crate) fn pin_record(&self, pin: usize) -> Result<&PinRecord> {
        self.pins
            .get(pin)
            .filter(|rec| rec.caps.valid)
            .ok_or_else(|| Error::InvalidParameter(format!("pin {pin} is not on the board")))
    }
}

/// Builder validating a board description before it becomes immutable.
pub struct BoardBuilder {
    board: Board,
}

impl BoardBuilder {
    pub fn pins(mut self, pins: Vec<PinRecord>) -> Self {
        self.board.pins = pins;
        self
    }

    pub fn gpio_count(mut self, count: usize) -> Self {
        self.board.gpio_count = count;
        self
    }

    pub fn aio_count(mut self, count: usize) -> Self {
        self.board.aio_count = count;
        self
    }

    pub fn i2c_buses(mut self, buses: Vec<I2cBusDef>, default: usize) -> Self {
        self.board.i2c_buses = buses;
        self.board.def_i2c_bus = default;
        self
    }

    pub fn spi_buses(mut self, buses: Vec<SpiBusDef>, default: usize) -> Self {
        self.board.spi_buses = buses;
        self.board.def_spi_bus = default;
        self
    }

    pub fn uart_devs(mut self, devs: Vec<UartDevDef>, default: usize) -> Self {
        self.board.uart_devs = devs;
        self.board.def_uart_dev = default;
        self
    }

    pub fn pwm_dev_count(mut self, count: usize) -> Self {
        self.board.pwm_dev_count = count;
        self
    }

    pub fn chardev_capable(mut self, capable: bool) -> Self {
        self.board.chardev_capable = capable;
        self
    }

    pub fn overrides(mut self, overrides: OverrideTable) -> Self {
        self.board.overrides = overrides;
        self
    }

    pub fn fs_layout(mut self, fs: FsLayout) -> Self {
        self.board.fs = fs;
        self
    }

    pub fn platform_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.board.platform_data = Some(data);
        self
    }

    /// Validate and freeze the board.
    ///
    /// Inconsistencies between the declared bus tables and the
    /// capability-marked pins are construction-time faults; the running
    /// core never re-checks them.
    pub fn build(self) -> Result<Board> {
        let b = self.board;

        for (i, rec) in b.pins.iter().enumerate() {
            for mapping in [&rec.gpio, &rec.pwm, &rec.spi, &rec.i2c, &rec.aio, &rec.uart]
                .into_iter()
                .flatten()
            {
                if mapping.mux.len() > MAX_MUX_STEPS {
                    return Err(Error::InvalidParameter(format!(
                        "pin {i} carries {} mux steps, max is {MAX_MUX_STEPS}",
                        mapping.mux.len()
                    )));
                }
            }
            if rec.caps.gpio && rec.gpio.is_none() {
                return Err(Error::InvalidParameter(format!(
                    "pin {i} is gpio-capable but has no gpio mapping"
                )));
            }
        }

        let gpio_capable = b.pins.iter().filter(|p| p.caps.gpio).count();
        if b.gpio_count > gpio_capable {
            return Err(Error::InvalidParameter(format!(
                "gpio_count {} exceeds the {gpio_capable} gpio-capable pins",
                b.gpio_count
            )));
        }
        let aio_capable = b.pins.iter().filter(|p| p.caps.aio).count();
        if b.aio_count > aio_capable {
            return Err(Error::InvalidParameter(format!(
                "aio_count {} exceeds the {aio_capable} aio-capable pins",
                b.aio_count
            )));
        }

        for bus in &b.i2c_buses {
            for pin in [bus.sda, bus.scl] {
                if !b.pins.get(pin).map(|p| p.caps.i2c).unwrap_or(false) {
                    return Err(Error::InvalidParameter(format!(
                        "i2c bus {} references pin {pin} which is not i2c-capable",
                        bus.bus_id
                    )));
                }
            }
        }
        if !b.i2c_buses.is_empty() && b.def_i2c_bus >= b.i2c_buses.len() {
            return Err(Error::InvalidParameter(format!(
                "default i2c bus {} out of range",
                b.def_i2c_bus
            )));
        }
        for bus in &b.spi_buses {
            for pin in [bus.sclk, bus.mosi, bus.miso].into_iter().flatten() {
                if !b.pins.get(pin).map(|p| p.caps.spi).unwrap_or(false) {
                    return Err(Error::InvalidParameter(format!(
                        "spi bus {} references pin {pin} which is not spi-capable",
                        bus.bus_id
                    )));
                }
            }
        }
        for dev in &b.uart_devs {
            for pin in [dev.rx, dev.tx].into_iter().flatten() {
                if !b.pins.get(pin).map(|p| p.caps.uart).unwrap_or(false) {
                    return Err(Error::InvalidParameter(format!(
                        "uart {} references pin {pin} which is not uart-capable",
                        dev.device_path.display()
                    )));
                }
            }
        }

        Ok(b)
    }
}

/// Ordered stack of board segments sharing one logical pin namespace.
///
/// The first segment is the primary board; each sub-platform appended
/// after it extends the namespace, with its local indices offset by the
/// total pin count of the segments before it.
#[derive(Debug, Clone, Default)]
pub struct Platform {
    segments: Vec<Arc<Board>>,
}

impl Platform {
    /// Platform with a primary board.
    pub fn new(primary: Board) -> Self {
        Platform {
            segments: vec![Arc::new(primary)],
        }
    }

    /// A platform with no boards; every resolution fails with
    /// [`Error::PlatformNotInitialised`].
    pub fn uninitialised() -> Self {
        Platform::default()
    }

    /// Append a sub-platform segment, extending the pin namespace.
    pub fn push_sub_platform(&mut self, board: Board) {
        self.segments.push(Arc::new(board));
    }

    /// The primary board.
    pub fn primary(&self) -> Result<&Arc<Board>> {
        self.segments.first().ok_or(Error::PlatformNotInitialised)
    }

    pub fn has_sub_platform(&self) -> bool {
        self.segments.len() > 1
    }

    /// Total pins across all segments.
    pub fn phy_pin_count(&self) -> usize {
        self.segments.iter().map(|b| b.phy_pin_count()).sum()
    }

    /// Resolve a logical pin index to its owning segment and the index
    /// local to that segment.
    pub fn resolve(&self, pin: usize) -> Result<(&Arc<Board>, usize)> {
        if self.segments.is_empty() {
            return Err(Error::PlatformNotInitialised);
        }
        let mut base = 0;
        for board in &self.segments {
            let count = board.phy_pin_count();
            if pin < base + count {
                return Ok((board, pin - base));
            }
            base += count;
        }
        Err(Error::InvalidParameter(format!(
            "pin {pin} exceeds the platform's {base} pins"
        )))
    }

    /// Segment-resolved pin record for a logical pin.
    pub fn pin_record(&self, pin: usize) -> Result<(&Arc<Board>, usize, &PinRecord)> {
        let (board, local) = self.resolve(pin)?;
        let rec = board.pin_record(local)?;
        Ok((board, local, rec))
    }

    /// Global index of the first pin named `name`, searching segments in
    /// stack order.
    pub fn pin_index_by_name(&self, name: &str) -> Option<usize> {
        let mut base = 0;
        for board in &self.segments {
            if let Some(local) = board.pin_index_by_name(name) {
                return Some(base + local);
            }
            base += board.phy_pin_count();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpio_pin(name: &str, pinmap: u32) -> PinRecord {
        PinRecord {
            name: name.to_string(),
            caps: Capabilities::gpio(),
            gpio: Some(PinMapping::raw(pinmap)),
            ..Default::default()
        }
    }

    #[test]
    fn test_builder_rejects_overlong_mux_chain() {
        let mut pin = gpio_pin("IO0", 10);
        pin.gpio.as_mut().unwrap().mux = vec![
            MuxStep {
                pin: 1,
                cmd: MuxCmd::Skip,
                value: 0,
            };
            MAX_MUX_STEPS + 1
        ];
        let err = Board::builder("test")
            .pins(vec![pin])
            .gpio_count(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_builder_rejects_inconsistent_bus_table() {
        let err = Board::builder("test")
            .pins(vec![gpio_pin("IO0", 10)])
            .gpio_count(1)
            .i2c_buses(
                vec![I2cBusDef {
                    bus_id: 0,
                    sda: 0,
                    scl: 0,
                }],
                0,
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_sub_platform_extends_namespace() {
        let primary = Board::builder("primary")
            .pins(vec![gpio_pin("IO0", 10), gpio_pin("IO1", 11)])
            .gpio_count(2)
            .build()
            .unwrap();
        let bridge = Board::builder("bridge")
            .pins(vec![gpio_pin("BRIDGE0", 0)])
            .gpio_count(1)
            .build()
            .unwrap();

        let mut platform = Platform::new(primary);
        platform.push_sub_platform(bridge);

        assert_eq!(platform.phy_pin_count(), 3);
        let (board, local) = platform.resolve(2).unwrap();
        assert_eq!(board.name, "bridge");
        assert_eq!(local, 0);
        assert_eq!(platform.pin_index_by_name("BRIDGE0"), Some(2));
        assert!(matches!(
            platform.resolve(3),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_uninitialised_platform_reports_not_initialised() {
        let platform = Platform::uninitialised();
        assert!(matches!(
            platform.resolve(0),
            Err(Error::PlatformNotInitialised)
        ));
    }
}
