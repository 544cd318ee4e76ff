//! Hardware PWM through the `pwmchip` sysfs class.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::board::{Board, Platform};
use crate::error::{Error, Result};
use crate::mux;
use crate::tracing::prelude::*;

/// One exported PWM channel.
pub struct Pwm {
    board: Arc<Board>,
    chip: u32,
    channel: u32,
    period_us: Option<u32>,
    owner: bool,
    closed: bool,
}

impl Platform {
    /// Open the PWM channel behind a logical pin, muxing the pin to its
    /// PWM function first.
    pub fn pwm(&self, pin: usize) -> Result<Pwm> {
        let (board, _local, rec) = self.pin_record(pin)?;
        if !rec.caps.pwm {
            return Err(Error::FeatureNotSupported(format!(
                "pin {pin} ({}) has no pwm capability",
                rec.name
            )));
        }
        let board = Arc::clone(board);
        let mapping = rec
            .pwm
            .clone()
            .ok_or_else(|| Error::Unspecified(format!("pin {pin} lacks a pwm mapping")))?;
        mux::apply(&board, &mapping)?;
        let chip = mapping.parent.ok_or_else(|| {
            Error::Unspecified(format!("pin {pin} pwm mapping lacks a chip id"))
        })?;
        Pwm::open(board, chip, mapping.pinmap)
    }

    /// Open a (chip, channel) pair directly, bypassing the pin table.
    pub fn pwm_raw(&self, chip: u32, channel: u32) -> Result<Pwm> {
        Pwm::open(Arc::clone(self.primary()?), chip, channel)
    }
}

impl Pwm {
    fn open(board: Arc<Board>, chip: u32, channel: u32) -> Result<Pwm> {
        let mut ctx = Pwm {
            board,
            chip,
            channel,
            period_us: None,
            owner: true,
            closed: false,
        };
        let hook = ctx.board.overrides.pwm.init;
        hook.run(&mut ctx, (), |ctx, ()| {
            let export = ctx.chip_dir().join("export");
            match OpenOptions::new().write(true).truncate(true).open(&export) {
                Ok(mut f) => match f.write_all(ctx.channel.to_string().as_bytes()) {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                        debug!(chip = ctx.chip, channel = ctx.channel, "pwm channel already exported");
                        ctx.owner = false;
                    }
                    Err(e) => return Err(Error::invalid_resource(export.display().to_string(), e)),
                },
                Err(e) => return Err(Error::invalid_resource(export.display().to_string(), e)),
            }
            // The channel directory must be there now.
            let period = ctx.attr_path("period");
            if !period.exists() {
                return Err(Error::invalid_resource(
                    period.display().to_string(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "channel did not appear"),
                ));
            }
            debug!(chip = ctx.chip, channel = ctx.channel, "pwm channel open");
            Ok(())
        })?;
        Ok(ctx)
    }

    fn chip_dir(&self) -> PathBuf {
        self.board.fs.pwm.join(format!("pwmchip{}", self.chip))
    }

    fn attr_path(&self, name: &str) -> PathBuf {
        self.chip_dir()
            .join(format!("pwm{}", self.channel))
            .join(name)
    }

    fn write_attr(&self, name: &str, value: &str) -> Result<()> {
        let path = self.attr_path(name);
        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
        f.write_all(value.as_bytes())
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))
    }

    fn read_attr(&self, name: &str) -> Result<u64> {
        let path = self.attr_path(name);
        let mut buf = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut buf))
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
        buf.trim_end()
            .parse()
            .map_err(|_| Error::Unspecified(format!("malformed pwm attribute {name}: {buf:?}")))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidHandle("pwm context closed"));
        }
        Ok(())
    }

    /// Set the period in microseconds.
    pub fn set_period_us(&mut self, period_us: u32) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.pwm.period;
        hook.run(self, period_us, |ctx, period_us| {
            if period_us == 0 {
                return Err(Error::InvalidParameter("pwm period must be non-zero".into()));
            }
            ctx.write_attr("period", &(u64::from(period_us) * 1_000).to_string())?;
            ctx.period_us = Some(period_us);
            Ok(())
        })
    }

    /// Duty cycle as a fraction of the period.
    pub fn read(&mut self) -> Result<f32> {
        self.ensure_open()?;
        let hook = self.board.overrides.pwm.read;
        hook.run(self, (), |ctx, ()| {
            let period = ctx.read_attr("period")?;
            if period == 0 {
                return Err(Error::Unspecified("pwm period reads back as zero".into()));
            }
            let duty = ctx.read_attr("duty_cycle")?;
            Ok(duty as f32 / period as f32)
        })
    }

    /// Set the duty cycle as a fraction of the period.
    pub fn write(&mut self, duty: f32) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.pwm.write;
        hook.run(self, duty, |ctx, duty| {
            if !(0.0..=1.0).contains(&duty) {
                return Err(Error::InvalidParameter(format!(
                    "duty cycle {duty} outside 0.0..=1.0"
                )));
            }
            let period = ctx.read_attr("period")?;
            let duty_ns = (period as f64 * f64::from(duty)) as u64;
            ctx.write_attr("duty_cycle", &duty_ns.to_string())
        })
    }

    /// Start or stop the output.
    pub fn enable(&mut self, enable: bool) -> Result<()> {
        self.ensure_open()?;
        let hook = self.board.overrides.pwm.enable;
        hook.run(self, enable, |ctx, enable| {
            ctx.write_attr("enable", if enable { "1" } else { "0" })
        })
    }

    /// Release the channel, unexporting it if this context exported it.
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.owner {
            let unexport = self.chip_dir().join("unexport");
            let mut f = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&unexport)
                .map_err(|e| Error::invalid_resource(unexport.display().to_string(), e))?;
            f.write_all(self.channel.to_string().as_bytes())
                .map_err(|e| Error::invalid_resource(unexport.display().to_string(), e))?;
        }
        Ok(())
    }
}

impl Drop for Pwm {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_mut() {
                warn!(error = %e, "pwm context leaked resources on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Capabilities, FsLayout, PinMapping, PinRecord};
    use std::fs;
    use std::path::Path;

    fn fake_pwm_tree(chip: u32, channel: u32) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let chip_dir = dir.path().join(format!("pwmchip{chip}"));
        let chan_dir = chip_dir.join(format!("pwm{channel}"));
        fs::create_dir_all(&chan_dir).unwrap();
        fs::write(chip_dir.join("export"), "").unwrap();
        fs::write(chip_dir.join("unexport"), "").unwrap();
        fs::write(chan_dir.join("period"), "0").unwrap();
        fs::write(chan_dir.join("duty_cycle"), "0").unwrap();
        fs::write(chan_dir.join("enable"), "0").unwrap();
        dir
    }

    fn pwm_platform(root: &Path) -> Platform {
        let mut mapping = PinMapping::raw(3);
        mapping.parent = Some(0);
        let pins = vec![PinRecord {
            name: "PWM3".into(),
            caps: Capabilities {
                valid: true,
                pwm: true,
                ..Default::default()
            },
            pwm: Some(mapping),
            ..Default::default()
        }];
        let mut fs_layout = FsLayout::default();
        fs_layout.pwm = root.to_path_buf();
        Platform::new(
            crate::board::Board::builder("pwm-test")
                .pins(pins)
                .pwm_dev_count(1)
                .fs_layout(fs_layout)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_period_duty_and_enable() {
        let root = fake_pwm_tree(0, 3);
        let platform = pwm_platform(root.path());
        let mut pwm = platform.pwm(0).unwrap();

        pwm.set_period_us(20_000).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("pwmchip0/pwm3/period")).unwrap(),
            "20000000"
        );

        pwm.write(0.25).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("pwmchip0/pwm3/duty_cycle")).unwrap(),
            "5000000"
        );
        assert!((pwm.read().unwrap() - 0.25).abs() < 1e-6);

        pwm.enable(true).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("pwmchip0/pwm3/enable")).unwrap(),
            "1"
        );

        assert!(matches!(
            pwm.write(1.5),
            Err(Error::InvalidParameter(_))
        ));

        pwm.close().unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("pwmchip0/unexport")).unwrap(),
            "3"
        );
    }
}
