//! Analog input through the IIO sysfs raw-value files.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::board::{Board, Platform};
use crate::error::{Error, Result};
use crate::mux;
use crate::tracing::prelude::*;

/// One analog input channel.
pub struct Aio {
    board: Arc<Board>,
    channel: u32,
    raw_path: PathBuf,
    closed: bool,
}

impl Platform {
    /// Open the analog channel behind a logical pin, muxing it to its
    /// analog function first.
    pub fn aio(&self, pin: usize) -> Result<Aio> {
        let (board, _local, rec) = self.pin_record(pin)?;
        if !rec.caps.aio {
            return Err(Error::FeatureNotSupported(format!(
                "pin {pin} ({}) has no analog capability",
                rec.name
            )));
        }
        let board = Arc::clone(board);
        let mapping = rec
            .aio
            .clone()
            .ok_or_else(|| Error::Unspecified(format!("pin {pin} lacks an aio mapping")))?;
        mux::apply(&board, &mapping)?;
        Aio::open(board, mapping.pinmap)
    }
}

impl Aio {
    fn open(board: Arc<Board>, channel: u32) -> Result<Aio> {
        let device = mapping_device(&board);
        let mut ctx = Aio {
            board,
            channel,
            raw_path: device.join(format!("in_voltage{channel}_raw")),
            closed: false,
        };
        let hook = ctx.board.overrides.aio.init;
        hook.run(&mut ctx, (), |ctx, ()| {
            if !ctx.raw_path.exists() {
                return Err(Error::invalid_resource(
                    ctx.raw_path.display().to_string(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such adc channel"),
                ));
            }
            debug!(channel = ctx.channel, "aio channel open");
            Ok(())
        })?;
        Ok(ctx)
    }

    /// Read the raw ADC value.
    pub fn read(&mut self) -> Result<u32> {
        if self.closed {
            return Err(Error::InvalidHandle("aio context closed"));
        }
        let hook = self.board.overrides.aio.read;
        hook.run(self, (), |ctx, ()| {
            let mut buf = String::new();
            File::open(&ctx.raw_path)
                .and_then(|mut f| f.read_to_string(&mut buf))
                .map_err(|e| Error::invalid_resource(ctx.raw_path.display().to_string(), e))?;
            buf.trim_end()
                .parse()
                .map_err(|_| Error::Unspecified(format!("malformed adc reading: {buf:?}")))
        })
    }

    /// ADC channel number of this context.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Release the channel.
    pub fn close(mut self) -> Result<()> {
        let hook = self.board.overrides.aio.close;
        let result = hook.run(&mut self, (), |_ctx, ()| Ok(()));
        self.closed = true;
        result
    }
}

fn mapping_device(board: &Board) -> PathBuf {
    board.fs.iio.join("iio:device0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Capabilities, FsLayout, PinMapping, PinRecord};
    use std::fs;

    fn aio_platform(root: &std::path::Path) -> Platform {
        let pins = vec![PinRecord {
            name: "A0".into(),
            caps: Capabilities {
                valid: true,
                aio: true,
                ..Default::default()
            },
            aio: Some(PinMapping::raw(0)),
            ..Default::default()
        }];
        let mut fs_layout = FsLayout::default();
        fs_layout.iio = root.to_path_buf();
        Platform::new(
            crate::board::Board::builder("aio-test")
                .pins(pins)
                .aio_count(1)
                .fs_layout(fs_layout)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_raw_reading_parsed() {
        let root = tempfile::tempdir().unwrap();
        let device = root.path().join("iio:device0");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("in_voltage0_raw"), "713\n").unwrap();

        let platform = aio_platform(root.path());
        let mut aio = platform.aio(0).unwrap();
        assert_eq!(aio.read().unwrap(), 713);
        aio.close().unwrap();
    }

    #[test]
    fn test_missing_channel_is_invalid_resource() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("iio:device0")).unwrap();
        let platform = aio_platform(root.path());
        assert!(matches!(
            platform.aio(0),
            Err(Error::InvalidResource { .. })
        ));
    }
}
