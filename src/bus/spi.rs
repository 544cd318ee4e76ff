//! SPI master access through `/dev/spidev*`.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use crate::board::{Board, Platform};
use crate::error::{Error, Result};
use crate::mux;
use crate::tracing::prelude::*;

/// Clock polarity/phase combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    /// CPOL = 0, CPHA = 0
    Mode0,
    /// CPOL = 0, CPHA = 1
    Mode1,
    /// CPOL = 1, CPHA = 0
    Mode2,
    /// CPOL = 1, CPHA = 1
    Mode3,
}

impl SpiMode {
    fn bits(self) -> u8 {
        match self {
            SpiMode::Mode0 => 0,
            SpiMode::Mode1 => 0x01,
            SpiMode::Mode2 => 0x02,
            SpiMode::Mode3 => 0x03,
        }
    }
}

#[repr(C)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

const SPI_IOC_MAGIC: u8 = b'k';

nix::ioctl_write_ptr!(spi_wr_mode, SPI_IOC_MAGIC, 1, u8);
nix::ioctl_write_ptr!(spi_wr_lsb_first, SPI_IOC_MAGIC, 2, u8);
nix::ioctl_write_ptr!(spi_wr_bits_per_word, SPI_IOC_MAGIC, 3, u8);
nix::ioctl_write_ptr!(spi_wr_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
nix::ioctl_write_ptr!(spi_message_1, SPI_IOC_MAGIC, 0, [SpiIocTransfer; 1]);

/// An open SPI bus with one chip select.
pub struct Spi {
    board: Arc<Board>,
    bus_id: u32,
    cs: u32,
    file: Option<File>,
    speed_hz: u32,
    bits_per_word: u8,
    closed: bool,
}

impl Platform {
    /// Open an SPI bus by its index in the board's bus table, muxing
    /// the bus pins first.
    pub fn spi(&self, bus: usize) -> Result<Spi> {
        let board = Arc::clone(self.primary()?);
        let def = *board.spi_buses.get(bus).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "spi bus {bus} out of range ({} buses)",
                board.spi_buses.len()
            ))
        })?;
        for pin in [def.sclk, def.mosi, def.miso].into_iter().flatten() {
            let rec = board
                .pins
                .get(pin)
                .ok_or_else(|| Error::Unspecified(format!("spi bus table references pin {pin}")))?;
            if let Some(mapping) = &rec.spi {
                mux::apply(&board, mapping)?;
            }
        }
        Spi::open(board, def.bus_id, def.cs)
    }

    /// Open a kernel spidev directly, bypassing the bus table and mux
    /// chains.
    pub fn spi_raw(&self, bus_id: u32, cs: u32) -> Result<Spi> {
        Spi::open(Arc::clone(self.primary()?), bus_id, cs)
    }
}

impl Spi {
    fn open(board: Arc<Board>, bus_id: u32, cs: u32) -> Result<Spi> {
        let mut ctx = Spi {
            board,
            bus_id,
            cs,
            file: None,
            speed_hz: 4_000_000,
            bits_per_word: 8,
            closed: false,
        };
        let hook = ctx.board.overrides.spi.init;
        hook.run(&mut ctx, (), |ctx, ()| {
            let path = ctx
                .board
                .fs
                .dev
                .join(format!("spidev{}.{}", ctx.bus_id, ctx.cs));
            let file = File::options()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
            ctx.file = Some(file);
            debug!(bus = ctx.bus_id, cs = ctx.cs, "spi bus open");
            Ok(())
        })?;
        Ok(ctx)
    }

    fn fd(&self) -> Result<libc::c_int> {
        if self.closed {
            return Err(Error::InvalidHandle("spi context closed"));
        }
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(Error::InvalidHandle("spi bus not open"))
    }

    /// Transmit least-significant bit first.
    pub fn set_lsbmode(&mut self, lsb: bool) -> Result<()> {
        let hook = self.board.overrides.spi.lsbmode;
        hook.run(self, lsb, |ctx, lsb| {
            let flag: u8 = u8::from(lsb);
            // SAFETY: valid descriptor and pointer.
            unsafe { spi_wr_lsb_first(ctx.fd()?, &flag) }
                .map_err(|e| ioctl_err("SPI_IOC_WR_LSB_FIRST", e))?;
            Ok(())
        })
    }

    /// Select clock polarity and phase.
    pub fn set_mode(&mut self, mode: SpiMode) -> Result<()> {
        let hook = self.board.overrides.spi.mode;
        hook.run(self, mode, |ctx, mode| {
            let bits = mode.bits();
            // SAFETY: valid descriptor and pointer.
            unsafe { spi_wr_mode(ctx.fd()?, &bits) }.map_err(|e| ioctl_err("SPI_IOC_WR_MODE", e))?;
            Ok(())
        })
    }

    /// Word size in bits.
    pub fn set_bit_per_word(&mut self, bits: u8) -> Result<()> {
        let hook = self.board.overrides.spi.bit_per_word;
        hook.run(self, bits, |ctx, bits| {
            // SAFETY: valid descriptor and pointer.
            unsafe { spi_wr_bits_per_word(ctx.fd()?, &bits) }
                .map_err(|e| ioctl_err("SPI_IOC_WR_BITS_PER_WORD", e))?;
            ctx.bits_per_word = bits;
            Ok(())
        })
    }

    /// Maximum clock frequency in Hz.
    pub fn set_frequency(&mut self, hz: u32) -> Result<()> {
        let hook = self.board.overrides.spi.frequency;
        hook.run(self, hz, |ctx, hz| {
            // SAFETY: valid descriptor and pointer.
            unsafe { spi_wr_max_speed_hz(ctx.fd()?, &hz) }
                .map_err(|e| ioctl_err("SPI_IOC_WR_MAX_SPEED_HZ", e))?;
            ctx.speed_hz = hz;
            Ok(())
        })
    }

    /// Full-duplex transfer: clock `tx` out while filling `rx`.
    pub fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let hook = self.board.overrides.spi.transfer;
        hook.run(self, tx, rx, |ctx, tx, rx| {
            if tx.len() != rx.len() {
                return Err(Error::InvalidParameter(format!(
                    "transfer buffers differ: {} tx vs {} rx bytes",
                    tx.len(),
                    rx.len()
                )));
            }
            let xfer = [SpiIocTransfer {
                tx_buf: tx.as_ptr() as u64,
                rx_buf: rx.as_mut_ptr() as u64,
                len: tx.len() as u32,
                speed_hz: ctx.speed_hz,
                delay_usecs: 0,
                bits_per_word: ctx.bits_per_word,
                cs_change: 0,
                tx_nbits: 0,
                rx_nbits: 0,
                word_delay_usecs: 0,
                pad: 0,
            }];
            // SAFETY: the buffers outlive the ioctl and the lengths
            // match the descriptor contents.
            unsafe { spi_message_1(ctx.fd()?, &xfer) }
                .map_err(|e| ioctl_err("SPI_IOC_MESSAGE", e))?;
            Ok(())
        })
    }

    /// Half-duplex write, discarding anything clocked in.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let hook = self.board.overrides.spi.write;
        hook.run(self, data, |ctx, data| {
            if ctx.closed {
                return Err(Error::InvalidHandle("spi context closed"));
            }
            ctx.file
                .as_mut()
                .ok_or(Error::InvalidHandle("spi bus not open"))?
                .write_all(data)
                .map_err(|e| Error::Unspecified(format!("spi write failed: {e}")))
        })
    }

    /// Release the bus.
    pub fn stop(mut self) -> Result<()> {
        let hook = self.board.overrides.spi.stop;
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
