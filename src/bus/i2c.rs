//! I2C master access through `/dev/i2c-*`.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use crate::board::{Board, Platform};
use crate::error::{Error, Result};
use crate::mux;
use crate::tracing::prelude::*;

/// Standard bus speed grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cMode {
    /// 100 kHz
    Std,
    /// 400 kHz
    Fast,
    /// 3.4 MHz
    High,
}

const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;

const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_WORD_DATA: u32 = 3;
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;
const I2C_SMBUS_BLOCK_MAX: usize = 32;

#[repr(C)]
struct I2cSmbusData {
    /// Large enough for byte, word and block + length/padding.
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

nix::ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE as libc::c_int);
nix::ioctl_write_ptr_bad!(i2c_smbus_access, I2C_SMBUS as libc::c_int, I2cSmbusIoctlData);

/// An open I2C bus.
pub struct I2c {
    board: Arc<Board>,
    bus_id: u32,
    file: Option<File>,
    addr: Option<u8>,
    closed: bool,
}

impl Platform {
    /// Open an I2C bus by its index in the board's bus table, muxing
    /// the SDA/SCL pins first.
    pub fn i2c(&self, bus: usize) -> Result<I2c> {
        let board = Arc::clone(self.primary()?);
        let def = *board.i2c_buses.get(bus).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "i2c bus {bus} out of range ({} buses)",
                board.i2c_buses.len()
            ))
        })?;
        for pin in [def.sda, def.scl] {
            let rec = board
                .pins
                .get(pin)
                .ok_or_else(|| Error::Unspecified(format!("i2c bus table references pin {pin}")))?;
            if let Some(mapping) = &rec.i2c {
                mux::apply(&board, mapping)?;
            }
        }
        I2c::open(board, def.bus_id)
    }

    /// Open the board's default I2C bus.
    pub fn i2c_default(&self) -> Result<I2c> {
        let bus = self.primary()?.def_i2c_bus;
        self.i2c(bus)
    }

    /// Open a kernel bus id directly, bypassing the bus table and mux
    /// chains.
    pub fn i2c_raw(&self, bus_id: u32) -> Result<I2c> {
        I2c::open(Arc::clone(self.primary()?), bus_id)
    }
}

impl I2c {
    fn open(board: Arc<Board>, bus_id: u32) -> Result<I2c> {
        let mut ctx = I2c {
            board,
            bus_id,
            file: None,
            addr: None,
            closed: false,
        };
        let hook = ctx.board.overrides.i2c.init;
        hook.run(&mut ctx, (), |ctx, ()| {
            let path = ctx.board.fs.dev.join(format!("i2c-{}", ctx.bus_id));
            let file = File::options()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
            ctx.file = Some(file);
            debug!(bus = ctx.bus_id, "i2c bus open");
            Ok(())
        })?;
        Ok(ctx)
    }

    fn fd(&self) -> Result<libc::c_int> {
        if self.closed {
            return Err(Error::InvalidHandle("i2c context closed"));
        }
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(Error::InvalidHandle("i2c bus not open"))
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        if self.closed {
            return Err(Error::InvalidHandle("i2c context closed"));
        }
        self.file.as_mut().ok_or(Error::InvalidHandle("i2c bus not open"))
    }

    fn require_addr(&self) -> Result<u8> {
        self.addr
            .ok_or_else(|| Error::InvalidParameter("no slave address set".into()))
    }

    /// Select the bus speed grade. The kernel i2c-dev interface has no
    /// frequency control, so without a platform override this reports
    /// the capability as unsupported.
    pub fn set_frequency(&mut self, mode: I2cMode) -> Result<()> {
        let hook = self.board.overrides.i2c.frequency;
        hook.run(self, mode, |_ctx, _mode| {
            Err(Error::FeatureNotSupported(
                "i2c frequency is fixed by the kernel bus driver".into(),
            ))
        })
    }

    /// Address the slave device for subsequent transfers.
    pub fn set_address(&mut self, addr: u8) -> Result<()> {
        let hook = self.board.overrides.i2c.address;
        hook.run(self, addr, |ctx, addr| {
            let fd = ctx.fd()?;
            // SAFETY: valid descriptor; I2C_SLAVE takes the address as
            // the ioctl argument.
            unsafe { i2c_set_slave(fd, libc::c_int::from(addr)) }
                .map_err(|e| ioctl_err("I2C_SLAVE", e))?;
            ctx.addr = Some(addr);
            Ok(())
        })
    }

    /// Read raw bytes from the addressed slave.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let hook = self.board.overrides.i2c.read;
        hook.run(self, buf, |ctx, buf| {
            ctx.require_addr()?;
            ctx.file_mut()?
                .read(buf)
                .map_err(|e| Error::Unspecified(format!("i2c read failed: {e}")))
        })
    }

    /// Read one byte from the addressed slave.
    pub fn read_byte(&mut self) -> Result<u8> {
        let hook = self.board.overrides.i2c.read_byte;
        hook.run(self, (), |ctx, ()| {
            let mut byte = [0u8; 1];
            ctx.require_addr()?;
            let n = ctx
                .file_mut()?
                .read(&mut byte)
                .map_err(|e| Error::Unspecified(format!("i2c read failed: {e}")))?;
            if n != 1 {
                return Err(Error::Unspecified("i2c short read".into()));
            }
            Ok(byte[0])
        })
    }

    /// SMBus read-byte-data.
    pub fn read_byte_data(&mut self, command: u8) -> Result<u8> {
        let hook = self.board.overrides.i2c.read_byte_data;
        hook.run(self, command, |ctx, command| {
            let data = ctx.smbus(I2C_SMBUS_READ, command, I2C_SMBUS_BYTE_DATA, None)?;
            Ok(data.block[0])
        })
    }

    /// SMBus read-word-data.
    pub fn read_word_data(&mut self, command: u8) -> Result<u16> {
        let hook = self.board.overrides.i2c.read_word_data;
        hook.run(self, command, |ctx, command| {
            let data = ctx.smbus(I2C_SMBUS_READ, command, I2C_SMBUS_WORD_DATA, None)?;
            Ok(u16::from_le_bytes([data.block[0], data.block[1]]))
        })
    }

    /// SMBus block read into `buf`, returning the byte count.
    pub fn read_bytes_data(&mut self, command: u8, buf: &mut [u8]) -> Result<usize> {
        let hook = self.board.overrides.i2c.read_bytes_data;
        hook.run(self, command, buf, |ctx, command, buf| {
            if buf.is_empty() || buf.len() > I2C_SMBUS_BLOCK_MAX {
                return Err(Error::InvalidParameter(format!(
                    "i2c block reads cover 1..={I2C_SMBUS_BLOCK_MAX} bytes, got {}",
                    buf.len()
                )));
            }
            let mut payload = I2cSmbusData {
                block: [0; I2C_SMBUS_BLOCK_MAX + 2],
            };
            payload.block[0] = buf.len() as u8;
            let data = ctx.smbus(
                I2C_SMBUS_READ,
                command,
                I2C_SMBUS_I2C_BLOCK_DATA,
                Some(payload),
            )?;
            let count = usize::from(data.block[0]).min(buf.len());
            buf[..count].copy_from_slice(&data.block[1..=count]);
            Ok(count)
        })
    }

    /// Write raw bytes to the addressed slave.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let hook = self.board.overrides.i2c.write;
        hook.run(self, data, |ctx, data| {
            ctx.require_addr()?;
            ctx.file_mut()?
                .write_all(data)
                .map_err(|e| Error::Unspecified(format!("i2c write failed: {e}")))
        })
    }

    /// Write a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        let hook = self.board.overrides.i2c.write_byte;
        hook.run(self, byte, |ctx, byte| {
            ctx.require_addr()?;
            ctx.file_mut()?
                .write_all(&[byte])
                .map_err(|e| Error::Unspecified(format!("i2c write failed: {e}")))
        })
    }

    /// SMBus write-byte-data.
    pub fn write_byte_data(&mut self, data: u8, command: u8) -> Result<()> {
        let hook = self.board.overrides.i2c.write_byte_data;
        hook.run(self, (data, command), |ctx, (data, command)| {
            let mut payload = I2cSmbusData {
                block: [0; I2C_SMBUS_BLOCK_MAX + 2],
            };
            payload.block[0] = data;
            ctx.smbus(I2C_SMBUS_WRITE, command, I2C_SMBUS_BYTE_DATA, Some(payload))?;
            Ok(())
        })
    }

    /// SMBus write-word-data.
    pub fn write_word_data(&mut self, data: u16, command: u8) -> Result<()> {
        let hook = self.board.overrides.i2c.write_word_data;
        hook.run(self, (data, command), |ctx, (data, command)| {
            let mut payload = I2cSmbusData {
                block: [0; I2C_SMBUS_BLOCK_MAX + 2],
            };
            payload.block[..2].copy_from_slice(&data.to_le_bytes());
            ctx.smbus(I2C_SMBUS_WRITE, command, I2C_SMBUS_WORD_DATA, Some(payload))?;
            Ok(())
        })
    }

    fn smbus(
        &mut self,
        read_write: u8,
        command: u8,
        size: u32,
        payload: Option<I2cSmbusData>,
    ) -> Result<I2cSmbusData> {
        self.require_addr()?;
        let fd = self.fd()?;
        let mut data = payload.unwrap_or(I2cSmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        });
        let args = I2cSmbusIoctlData {
            read_write,
            command,
            size,
            data: &mut data,
        };
        // SAFETY: valid descriptor, args points at live stack data for
        // the duration of the call.
        unsafe { i2c_smbus_access(fd, &args) }.map_err(|e| ioctl_err("I2C_SMBUS", e))?;
        Ok(data)
    }

    /// Kernel bus id of this context.
    pub fn bus_id(&self) -> u32 {
        self.bus_id
    }

    /// Release the bus.
    pub fn stop(mut self) -> Result<()> {
        let hook = self.board.overrides.i2c.stop;
        let result = hook.run(&mut self, (), |ctx, ()| {
            ctx.file = None;
            Ok(())
        });
        self.closed = true;
        result
    }
}

fn ioctl_err(what: &str, errno: nix::errno::Errno) -> Error {
    Error::invalid_resource(
        what.to_string(),
        std::io::Error::from_raw_os_error(errno as i32),
    )
}
