//! Bus contexts: I2C, SPI, PWM, UART and analog input.
//!
//! These are thin layers over the kernel's device files. Their job is
//! the init dispatch: validate the requested bus or pin against the
//! board tables, run the mux chains of every involved pin, and route
//! each operation through the board's override table. Initialization is
//! all or nothing — a failing step tears down whatever was claimed and
//! reports the first error.

pub mod aio;
pub mod i2c;
pub mod pwm;
pub mod spi;
pub mod uart;
