//! breakout — uniform peripheral access for Linux single-board
//! computers.
//!
//! A board module supplies a [`board::Board`]: a pin table mapping
//! logical pins to sysfs numbers or gpiochip lines, mux chains routing
//! each pin to its peripheral functions, and an override table that can
//! replace or wrap any primitive operation. Stacked into a
//! [`board::Platform`] (a primary board plus optional sub-platform
//! segments extending the pin namespace), that description drives one
//! common API for GPIO, I2C, SPI, UART, PWM and analog input:
//!
//! ```no_run
//! use breakout::gpio::{Direction, Edge};
//!
//! # fn main() -> breakout::Result<()> {
//! # let platform: breakout::board::Platform = unimplemented!();
//! let mut button = platform.gpio(7)?;
//! button.set_dir(Direction::In)?;
//! button.set_isr(Edge::Rising, || println!("pressed"))?;
//! # Ok(())
//! # }
//! ```
//!
//! All calls are synchronous and blocking on the caller's thread; the
//! only concurrency in the crate is the one background thread a GPIO
//! context spawns per registered interrupt callback.
//!
//! Everything is injected: there is no process-global "current board",
//! so several platforms — or the [`board::mock`] platform — can coexist
//! in one process.

pub mod board;
pub mod bus;
pub mod error;
pub mod gpio;
mod mux;
pub mod overrides;
pub mod tracing;

pub use board::{Board, Platform};
pub use error::{Error, Result};
pub use gpio::{Direction, Edge, Gpio, Level, Mode};
