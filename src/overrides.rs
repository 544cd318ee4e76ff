//! Per-platform operation override tables.
//!
//! Every primitive operation in the crate dispatches through a
//! [`Hook`]: a platform may install a `replace` function that runs
//! instead of the generic implementation, or `pre`/`post` functions that
//! wrap it. The protocol is uniform across all subsystems:
//!
//! 1. `replace` present: call it, return its result, skip everything
//!    else.
//! 2. `pre` present: call it; an error aborts before the generic code
//!    runs.
//! 3. Run the generic implementation.
//! 4. `post` present: call it; an error supersedes a successful generic
//!    result.
//!
//! Hooks are plain function pointers. Platform state a hook needs lives
//! on [`crate::board::Board::platform_data`] and is reached through the
//! context's board handle.
//!
//! A board that installs no hooks gets the fully generic sysfs/chardev
//! implementation.

use crate::bus::aio::Aio;
use crate::bus::i2c::{I2c, I2cMode};
use crate::bus::pwm::Pwm;
use crate::bus::spi::{Spi, SpiMode};
use crate::bus::uart::{Uart, UartMode};
use crate::error::Result;
use crate::gpio::{Direction, Edge, Gpio, Level, Mode, OutDriverMode};

/// One overridable operation: optional pre/replace/post stages around a
/// generic implementation.
pub struct Hook<C, A, R = ()> {
    pub pre: Option<fn(&mut C, A) -> Result<()>>,
    pub replace: Option<fn(&mut C, A) -> Result<R>>,
    pub post: Option<fn(&mut C, A) -> Result<()>>,
}

impl<C, A: Copy, R> Hook<C, A, R> {
    /// Apply the three-stage protocol around `generic`.
    pub fn run(
        &self,
        ctx: &mut C,
        arg: A,
        generic: impl FnOnce(&mut C, A) -> Result<R>,
    ) -> Result<R> {
        if let Some(replace) = self.replace {
            return replace(ctx, arg);
        }
        if let Some(pre) = self.pre {
            pre(ctx, arg)?;
        }
        let out = generic(ctx, arg)?;
        if let Some(post) = self.post {
            post(ctx, arg)?;
        }
        Ok(out)
    }
}

impl<C, A, R> Default for Hook<C, A, R> {
    fn default() -> Self {
        Hook {
            pre: None,
            replace: None,
            post: None,
        }
    }
}

impl<C, A, R> Clone for Hook<C, A, R> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C, A, R> Copy for Hook<C, A, R> {}

/// Hook for operations filling a caller-supplied buffer.
pub struct BufReadHook<C> {
    pub pre: Option<fn(&mut C, &mut [u8]) -> Result<()>>,
    pub replace: Option<fn(&mut C, &mut [u8]) -> Result<usize>>,
    pub post: Option<fn(&mut C, &mut [u8]) -> Result<()>>,
}

impl<C> BufReadHook<C> {
    pub fn run(
        &self,
        ctx: &mut C,
        buf: &mut [u8],
        generic: impl FnOnce(&mut C, &mut [u8]) -> Result<usize>,
    ) -> Result<usize> {
        if let Some(replace) = self.replace {
            return replace(ctx, buf);
        }
        if let Some(pre) = self.pre {
            pre(ctx, buf)?;
        }
        let out = generic(ctx, buf)?;
        if let Some(post) = self.post {
            post(ctx, buf)?;
        }
        Ok(out)
    }
}

impl<C> Default for BufReadHook<C> {
    fn default() -> Self {
        BufReadHook {
            pre: None,
            replace: None,
            post: None,
        }
    }
}

impl<C> Clone for BufReadHook<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C> Copy for BufReadHook<C> {}

/// Hook for operations consuming a caller-supplied buffer.
pub struct BufWriteHook<C, R = ()> {
    pub pre: Option<fn(&mut C, &[u8]) -> Result<()>>,
    pub replace: Option<fn(&mut C, &[u8]) -> Result<R>>,
    pub post: Option<fn(&mut C, &[u8]) -> Result<()>>,
}

impl<C, R> BufWriteHook<C, R> {
    pub fn run(
        &self,
        ctx: &mut C,
        buf: &[u8],
        generic: impl FnOnce(&mut C, &[u8]) -> Result<R>,
    ) -> Result<R> {
        if let Some(replace) = self.replace {
            return replace(ctx, buf);
        }
        if let Some(pre) = self.pre {
            pre(ctx, buf)?;
        }
        let out = generic(ctx, buf)?;
        if let Some(post) = self.post {
            post(ctx, buf)?;
        }
        Ok(out)
    }
}

impl<C, R> Default for BufWriteHook<C, R> {
    fn default() -> Self {
        BufWriteHook {
            pre: None,
            replace: None,
            post: None,
        }
    }
}

impl<C, R> Clone for BufWriteHook<C, R> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C, R> Copy for BufWriteHook<C, R> {}

/// Hook for register-style reads: a command byte plus a result buffer.
pub struct CmdBufReadHook<C> {
    pub pre: Option<fn(&mut C, u8, &mut [u8]) -> Result<()>>,
    pub replace: Option<fn(&mut C, u8, &mut [u8]) -> Result<usize>>,
    pub post: Option<fn(&mut C, u8, &mut [u8]) -> Result<()>>,
}

impl<C> CmdBufReadHook<C> {
    pub fn run(
        &self,
        ctx: &mut C,
        cmd: u8,
        buf: &mut [u8],
        generic: impl FnOnce(&mut C, u8, &mut [u8]) -> Result<usize>,
    ) -> Result<usize> {
        if let Some(replace) = self.replace {
            return replace(ctx, cmd, buf);
        }
        if let Some(pre) = self.pre {
            pre(ctx, cmd, buf)?;
        }
        let out = generic(ctx, cmd, buf)?;
        if let Some(post) = self.post {
            post(ctx, cmd, buf)?;
        }
        Ok(out)
    }
}

impl<C> Default for CmdBufReadHook<C> {
    fn default() -> Self {
        CmdBufReadHook {
            pre: None,
            replace: None,
            post: None,
        }
    }
}

impl<C> Clone for CmdBufReadHook<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C> Copy for CmdBufReadHook<C> {}

/// Hook for full-duplex transfers: write buffer in, read buffer out.
pub struct TransferHook<C> {
    pub pre: Option<fn(&mut C, &[u8], &mut [u8]) -> Result<()>>,
    pub replace: Option<fn(&mut C, &[u8], &mut [u8]) -> Result<()>>,
    pub post: Option<fn(&mut C, &[u8], &mut [u8]) -> Result<()>>,
}

impl<C> TransferHook<C> {
    pub fn run(
        &self,
        ctx: &mut C,
        tx: &[u8],
        rx: &mut [u8],
        generic: impl FnOnce(&mut C, &[u8], &mut [u8]) -> Result<()>,
    ) -> Result<()> {
        if let Some(replace) = self.replace {
            return replace(ctx, tx, rx);
        }
        if let Some(pre) = self.pre {
            pre(ctx, tx, rx)?;
        }
        generic(ctx, tx, rx)?;
        if let Some(post) = self.post {
            post(ctx, tx, rx)?;
        }
        Ok(())
    }
}

impl<C> Default for TransferHook<C> {
    fn default() -> Self {
        TransferHook {
            pre: None,
            replace: None,
            post: None,
        }
    }
}

impl<C> Clone for TransferHook<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C> Copy for TransferHook<C> {}

/// GPIO hook points.
///
/// `read` and `write` receive the line position within the context
/// (always 0 for single-pin contexts); multi-pin reads and writes
/// dispatch once per position so a platform overriding single-line
/// access covers both.
#[derive(Default, Clone, Copy)]
pub struct GpioHooks {
    pub init: Hook<Gpio, ()>,
    pub close: Hook<Gpio, ()>,
    pub dir: Hook<Gpio, Direction>,
    pub read_dir: Hook<Gpio, (), Direction>,
    pub mode: Hook<Gpio, Mode>,
    pub edge_mode: Hook<Gpio, Edge>,
    pub read: Hook<Gpio, usize, Level>,
    pub write: Hook<Gpio, (usize, Level)>,
    pub isr: Hook<Gpio, Edge>,
    pub isr_exit: Hook<Gpio, ()>,
    pub out_driver_mode: Hook<Gpio, OutDriverMode>,
    pub mmap_setup: Hook<Gpio, bool>,
}

/// I2C hook points.
#[derive(Default, Clone, Copy)]
pub struct I2cHooks {
    pub init: Hook<I2c, ()>,
    pub frequency: Hook<I2c, I2cMode>,
    pub address: Hook<I2c, u8>,
    pub read: BufReadHook<I2c>,
    pub read_byte: Hook<I2c, (), u8>,
    pub read_byte_data: Hook<I2c, u8, u8>,
    pub read_word_data: Hook<I2c, u8, u16>,
    pub read_bytes_data: CmdBufReadHook<I2c>,
    pub write: BufWriteHook<I2c>,
    pub write_byte: Hook<I2c, u8>,
    pub write_byte_data: Hook<I2c, (u8, u8)>,
    pub write_word_data: Hook<I2c, (u16, u8)>,
    pub stop: Hook<I2c, ()>,
}

/// PWM hook points. Periods and pulse widths are in microseconds,
/// duty-cycle writes as a fraction of the period.
#[derive(Default, Clone, Copy)]
pub struct PwmHooks {
    pub init: Hook<Pwm, ()>,
    pub period: Hook<Pwm, u32>,
    pub read: Hook<Pwm, (), f32>,
    pub write: Hook<Pwm, f32>,
    pub enable: Hook<Pwm, bool>,
}

/// SPI hook points.
#[derive(Default, Clone, Copy)]
pub struct SpiHooks {
    pub init: Hook<Spi, ()>,
    pub lsbmode: Hook<Spi, bool>,
    pub mode: Hook<Spi, SpiMode>,
    pub bit_per_word: Hook<Spi, u8>,
    pub frequency: Hook<Spi, u32>,
    pub transfer: TransferHook<Spi>,
    pub write: BufWriteHook<Spi>,
    pub stop: Hook<Spi, ()>,
}

/// UART hook points. `timeout` carries (read, write, inter-byte)
/// milliseconds; `flowcontrol` carries (xon/xoff, rts/cts).
#[derive(Default, Clone, Copy)]
pub struct UartHooks {
    pub init: Hook<Uart, ()>,
    pub flush: Hook<Uart, ()>,
    pub sendbreak: Hook<Uart, i32>,
    pub baudrate: Hook<Uart, u32>,
    pub mode: Hook<Uart, UartMode>,
    pub flowcontrol: Hook<Uart, (bool, bool)>,
    pub timeout: Hook<Uart, (i32, i32, i32)>,
    pub non_blocking: Hook<Uart, bool>,
    pub read: BufReadHook<Uart>,
    pub write: BufWriteHook<Uart, usize>,
    pub data_available: Hook<Uart, u32, bool>,
}

/// AIO hook points.
#[derive(Default, Clone, Copy)]
pub struct AioHooks {
    pub init: Hook<Aio, ()>,
    pub close: Hook<Aio, ()>,
    pub read: Hook<Aio, (), u32>,
}

/// The full per-board override table. One instance per platform,
/// created at board-definition time and never mutated afterwards.
#[derive(Default, Clone, Copy)]
pub struct OverrideTable {
    pub gpio: GpioHooks,
    pub i2c: I2cHooks,
    pub pwm: PwmHooks,
    pub spi: SpiHooks,
    pub uart: UartHooks,
    pub aio: AioHooks,
}

impl std::fmt::Debug for OverrideTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OverrideTable { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    // A stand-in context; the protocol is generic over it.
    struct Ctx {
        generic_ran: bool,
        log: Vec<&'static str>,
    }

    fn hook_pre(ctx: &mut Ctx, _: u8) -> Result<()> {
        ctx.log.push("pre");
        Ok(())
    }

    fn hook_post(ctx: &mut Ctx, _: u8) -> Result<()> {
        ctx.log.push("post");
        Ok(())
    }

    fn hook_post_err(_: &mut Ctx, _: u8) -> Result<()> {
        Err(Error::Unspecified("post failed".into()))
    }

    fn hook_replace(ctx: &mut Ctx, arg: u8) -> Result<u8> {
        ctx.log.push("replace");
        Ok(arg + 1)
    }

    #[test]
    fn test_replace_skips_generic_entirely() {
        let hook = Hook::<Ctx, u8, u8> {
            pre: Some(hook_pre),
            replace: Some(hook_replace),
            post: Some(hook_post),
        };
        let mut ctx = Ctx {
            generic_ran: false,
            log: Vec::new(),
        };
        let out = hook
            .run(&mut ctx, 4, |ctx, _| {
                ctx.generic_ran = true;
                Ok(0)
            })
            .unwrap();
        assert_eq!(out, 5);
        assert!(!ctx.generic_ran);
        assert_eq!(ctx.log, vec!["replace"]);
    }

    #[test]
    fn test_pre_and_post_wrap_generic() {
        let hook = Hook::<Ctx, u8, u8> {
            pre: Some(hook_pre),
            replace: None,
            post: Some(hook_post),
        };
        let mut ctx = Ctx {
            generic_ran: false,
            log: Vec::new(),
        };
        let out = hook
            .run(&mut ctx, 4, |ctx, arg| {
                ctx.generic_ran = true;
                ctx.log.push("generic");
                Ok(arg * 2)
            })
            .unwrap();
        assert_eq!(out, 8);
        assert_eq!(ctx.log, vec!["pre", "generic", "post"]);
    }

    #[test]
    fn test_post_error_supersedes_generic_success() {
        let hook = Hook::<Ctx, u8> {
            pre: None,
            replace: None,
            post: Some(hook_post_err),
        };
        let mut ctx = Ctx {
            generic_ran: false,
            log: Vec::new(),
        };
        let err = hook
            .run(&mut ctx, 0, |ctx, _| {
                ctx.generic_ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(ctx.generic_ran);
        assert!(matches!(err, Error::Unspecified(_)));
    }

    #[test]
    fn test_pre_error_aborts_generic() {
        fn failing_pre(_: &mut Ctx, _: u8) -> Result<()> {
            Err(Error::NoResources("busy".into()))
        }
        let hook = Hook::<Ctx, u8> {
            pre: Some(failing_pre),
            replace: None,
            post: None,
        };
        let mut ctx = Ctx {
            generic_ran: false,
            log: Vec::new(),
        };
        let err = hook
            .run(&mut ctx, 0, |ctx, _| {
                ctx.generic_ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(!ctx.generic_ran);
        assert!(matches!(err, Error::NoResources(_)));
    }
}
