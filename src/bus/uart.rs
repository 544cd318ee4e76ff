//! UART access through termios on the kernel's tty devices.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::termios::{self, BaudRate, ControlFlags, InputFlags, SetArg, SpecialCharacterIndices};

use crate::board::{Board, Platform};
use crate::error::{Error, Result};
use crate::mux;
use crate::tracing::prelude::*;

/// Character framing: data bits, parity, stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartMode {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// An open serial device.
pub struct Uart {
    board: Arc<Board>,
    path: PathBuf,
    file: Option<File>,
    closed: bool,
}

impl Platform {
    /// Open a UART by its index in the board's device table, muxing the
    /// RX/TX pins first.
    pub fn uart(&self, index: usize) -> Result<Uart> {
        let board = Arc::clone(self.primary()?);
        let def = board
            .uart_devs
            .get(index)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "uart {index} out of range ({} devices)",
                    board.uart_devs.len()
                ))
            })?
            .clone();
        for pin in [def.rx, def.tx].into_iter().flatten() {
            let rec = board
                .pins
                .get(pin)
                .ok_or_else(|| Error::Unspecified(format!("uart table references pin {pin}")))?;
            if let Some(mapping) = &rec.uart {
                mux::apply(&board, mapping)?;
            }
        }
        Uart::open(board, &def.device_path)
    }

    /// Open the board's default UART.
    pub fn uart_default(&self) -> Result<Uart> {
        let index = self.primary()?.def_uart_dev;
        self.uart(index)
    }

    /// Open a tty device path directly, bypassing the device table and
    /// mux chains.
    pub fn uart_raw(&self, path: &Path) -> Result<Uart> {
        Uart::open(Arc::clone(self.primary()?), path)
    }
}

impl Uart {
    fn open(board: Arc<Board>, path: &Path) -> Result<Uart> {
        let mut ctx = Uart {
            board,
            path: path.to_path_buf(),
            file: None,
            closed: false,
        };
        let hook = ctx.board.overrides.uart.init;
        hook.run(&mut ctx, (), |ctx, ()| {
            let file = File::options()
                .read(true)
                .write(true)
                .open(&ctx.path)
                .map_err(|e| Error::invalid_resource(ctx.path.display().to_string(), e))?;
            ctx.file = Some(file);
            debug!(path = %ctx.path.display(), "uart open");
            Ok(())
        })?;
        Ok(ctx)
    }

    fn file(&self) -> Result<&File> {
        if self.closed {
            return Err(Error::InvalidHandle("uart context closed"));
        }
        self.file.as_ref().ok_or(Error::InvalidHandle("uart not open"))
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        if self.closed {
            return Err(Error::InvalidHandle("uart context closed"));
        }
        self.file.as_mut().ok_or(Error::InvalidHandle("uart not open"))
    }

    fn with_termios(
        &mut self,
        change: impl FnOnce(&mut termios::Termios) -> Result<()>,
    ) -> Result<()> {
        let file = self.file()?;
        let mut tio = termios::tcgetattr(file.as_fd())
            .map_err(|e| Error::Unspecified(format!("tcgetattr failed: {e}")))?;
        change(&mut tio)?;
        termios::tcsetattr(file.as_fd(), SetArg::TCSANOW, &tio)
            .map_err(|e| Error::Unspecified(format!("tcsetattr failed: {e}")))
    }

    /// Flush pending output to the device.
    pub fn flush(&mut self) -> Result<()> {
        let hook = self.board.overrides.uart.flush;
        hook.run(self, (), |ctx, ()| {
            termios::tcdrain(ctx.file()?.as_fd())
                .map_err(|e| Error::Unspecified(format!("tcdrain failed: {e}")))
        })
    }

    /// Send a break condition. `duration` follows `tcsendbreak`
    /// semantics (0 = 0.25-0.5 s).
    pub fn sendbreak(&mut self, duration: i32) -> Result<()> {
        let hook = self.board.overrides.uart.sendbreak;
        hook.run(self, duration, |ctx, duration| {
            termios::tcsendbreak(ctx.file()?.as_fd(), duration)
                .map_err(|e| Error::Unspecified(format!("tcsendbreak failed: {e}")))
        })
    }

    /// Set the line speed.
    pub fn set_baudrate(&mut self, baud: u32) -> Result<()> {
        let hook = self.board.overrides.uart.baudrate;
        hook.run(self, baud, |ctx, baud| {
            let rate = baud_constant(baud)?;
            ctx.with_termios(|tio| {
                termios::cfsetspeed(tio, rate)
                    .map_err(|e| Error::Unspecified(format!("cfsetspeed failed: {e}")))
            })
        })
    }

    /// Set character framing.
    pub fn set_mode(&mut self, mode: UartMode) -> Result<()> {
        let hook = self.board.overrides.uart.mode;
        hook.run(self, mode, |ctx, mode| {
            let size = match mode.data_bits {
                5 => ControlFlags::CS5,
                6 => ControlFlags::CS6,
                7 => ControlFlags::CS7,
                8 => ControlFlags::CS8,
                other => {
                    return Err(Error::InvalidParameter(format!(
                        "unsupported word size {other}"
                    )))
                }
            };
            if !matches!(mode.stop_bits, 1 | 2) {
                return Err(Error::InvalidParameter(format!(
                    "unsupported stop bit count {}",
                    mode.stop_bits
                )));
            }
            ctx.with_termios(|tio| {
                tio.control_flags.remove(ControlFlags::CSIZE);
                tio.control_flags.insert(size);
                tio.control_flags
                    .set(ControlFlags::CSTOPB, mode.stop_bits == 2);
                match mode.parity {
                    Parity::None => {
                        tio.control_flags.remove(ControlFlags::PARENB);
                    }
                    Parity::Even => {
                        tio.control_flags.insert(ControlFlags::PARENB);
                        tio.control_flags.remove(ControlFlags::PARODD);
                    }
                    Parity::Odd => {
                        tio.control_flags
                            .insert(ControlFlags::PARENB | ControlFlags::PARODD);
                    }
                }
                Ok(())
            })
        })
    }

    /// Configure software (xon/xoff) and hardware (rts/cts) flow
    /// control.
    pub fn set_flowcontrol(&mut self, xon_xoff: bool, rts_cts: bool) -> Result<()> {
        let hook = self.board.overrides.uart.flowcontrol;
        hook.run(self, (xon_xoff, rts_cts), |ctx, (xon_xoff, rts_cts)| {
            ctx.with_termios(|tio| {
                tio.input_flags
                    .set(InputFlags::IXON | InputFlags::IXOFF, xon_xoff);
                tio.control_flags.set(ControlFlags::CRTSCTS, rts_cts);
                Ok(())
            })
        })
    }

    /// Configure read/write/inter-byte timeouts in milliseconds. Only
    /// the read timeout maps onto termios (VTIME deciseconds); the
    /// others are accepted for API compatibility.
    pub fn set_timeout(&mut self, read: i32, write: i32, interchar: i32) -> Result<()> {
        let hook = self.board.overrides.uart.timeout;
        hook.run(self, (read, write, interchar), |ctx, (read, _, _)| {
            if read < 0 {
                return Err(Error::InvalidParameter("negative read timeout".into()));
            }
            let vtime = (read / 100).clamp(0, 255) as u8;
            ctx.with_termios(|tio| {
                tio.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime;
                tio.control_chars[SpecialCharacterIndices::VMIN as usize] =
                    u8::from(vtime == 0);
                Ok(())
            })
        })
    }

    /// Toggle non-blocking reads and writes.
    pub fn set_non_blocking(&mut self, non_blocking: bool) -> Result<()> {
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        let hook = self.board.overrides.uart.non_blocking;
        hook.run(self, non_blocking, |ctx, non_blocking| {
            let file = ctx.file()?;
            let bits = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)
                .map_err(|e| Error::Unspecified(format!("F_GETFL failed: {e}")))?;
            let mut flags = OFlag::from_bits_truncate(bits);
            flags.set(OFlag::O_NONBLOCK, non_blocking);
            fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags))
                .map_err(|e| Error::Unspecified(format!("F_SETFL failed: {e}")))?;
            Ok(())
        })
    }

    /// Read available bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let hook = self.board.overrides.uart.read;
        hook.run(self, buf, |ctx, buf| {
            ctx.file_mut()?
                .read(buf)
                .map_err(|e| Error::Unspecified(format!("uart read failed: {e}")))
        })
    }

    /// Write `buf`, returning the number of bytes accepted.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let hook = self.board.overrides.uart.write;
        hook.run(self, buf, |ctx, buf| {
            ctx.file_mut()?
                .write(buf)
                .map_err(|e| Error::Unspecified(format!("uart write failed: {e}")))
        })
    }

    /// Whether at least one byte can be read within `millis`.
    pub fn data_available(&mut self, millis: u32) -> Result<bool> {
        let hook = self.board.overrides.uart.data_available;
        hook.run(self, millis, |ctx, millis| {
            let file = ctx.file()?;
            let mut fds = [nix::poll::PollFd::new(
                file.as_fd(),
                nix::poll::PollFlags::POLLIN,
            )];
            let timeout =
                nix::poll::PollTimeout::try_from(millis.min(i32::MAX as u32) as i32)
                    .unwrap_or(nix::poll::PollTimeout::MAX);
            let n = nix::poll::poll(&mut fds, timeout)
                .map_err(|e| Error::Unspecified(format!("uart poll failed: {e}")))?;
            Ok(n > 0)
        })
    }

    /// Device path of this context.
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Release the device.
    pub fn stop(mut self) -> Result<()> {
        self.file = None;
        self.closed = true;
        Ok(())
    }
}

fn baud_constant(baud: u32) -> Result<BaudRate> {
    Ok(match baud {
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        other => {
            return Err(Error::InvalidParameter(format!(
                "unsupported baud rate {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_baud_rate_rejected() {
        assert!(matches!(
            baud_constant(12345),
            Err(Error::InvalidParameter(_))
        ));
        assert!(baud_constant(115200).is_ok());
    }
}
