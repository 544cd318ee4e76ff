//! Legacy sysfs GPIO backend (`/sys/class/gpio`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::gpio::{Direction, Edge, Level};
use crate::tracing::prelude::*;

#[derive(Debug)]
pub(crate) struct SysfsLine {
    root: PathBuf,
    line: u32,
    /// Kept open across the context's lifetime and rewound per access.
    value: File,
    /// Whether our export created the line. `EBUSY` from the export
    /// file means someone else already exported it; we adopt the line
    /// without claiming ownership.
    exported_here: bool,
}

impl SysfsLine {
    pub(crate) fn export(root: &Path, line: u32) -> Result<SysfsLine> {
        let export_path = root.join("export");
        let exported_here = match OpenOptions::new().write(true).truncate(true).open(&export_path) {
            Ok(mut f) => match f.write_all(line.to_string().as_bytes()) {
                Ok(()) => true,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    debug!(line, "line already exported, adopting");
                    false
                }
                Err(e) => return Err(Error::invalid_resource(export_path.display().to_string(), e)),
            },
            Err(e) => return Err(Error::invalid_resource(export_path.display().to_string(), e)),
        };

        let value_path = root.join(format!("gpio{line}")).join("value");
        let value = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&value_path)
            .map_err(|e| Error::invalid_resource(value_path.display().to_string(), e))?;

        trace!(line, exported_here, "sysfs line ready");
        Ok(SysfsLine {
            root: root.to_path_buf(),
            line,
            value,
            exported_here,
        })
    }

    pub(crate) fn line(&self) -> u32 {
        self.line
    }

    pub(crate) fn exported_here(&self) -> bool {
        self.exported_here
    }

    fn attr_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("gpio{}", self.line)).join(name)
    }

    fn write_attr(&self, name: &str, token: &str) -> Result<()> {
        let path = self.attr_path(name);
        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
        f.write_all(token.as_bytes())
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))
    }

    fn read_attr(&self, name: &str) -> Result<String> {
        let path = self.attr_path(name);
        let mut buf = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut buf))
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
        Ok(buf.trim_end().to_string())
    }

    pub(crate) fn set_direction(&mut self, dir: Direction) -> Result<()> {
        let token = match dir {
            Direction::In => "in",
            Direction::Out => "out",
            // The kernel folds these into out-with-initial-value.
            Direction::OutHigh => "high",
            Direction::OutLow => "low",
        };
        self.write_attr("direction", token)
    }

    pub(crate) fn direction(&self) -> Result<Direction> {
        match self.read_attr("direction")?.as_str() {
            "in" => Ok(Direction::In),
            "out" | "high" | "low" => Ok(Direction::Out),
            other => Err(Error::Unspecified(format!(
                "malformed sysfs direction for line {}: {other:?}",
                self.line
            ))),
        }
    }

    pub(crate) fn read(&mut self) -> Result<Level> {
        let mut buf = [0u8; 4];
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.read(&mut buf))
            .map_err(|e| Error::invalid_resource(format!("gpio{}/value", self.line), e))?;
        match buf[0] {
            b'0' => Ok(Level::Low),
            b'1' => Ok(Level::High),
            other => Err(Error::Unspecified(format!(
                "malformed sysfs value for line {}: {other:#04x}",
                self.line
            ))),
        }
    }

    pub(crate) fn write(&mut self, level: Level) -> Result<()> {
        let token = match level {
            Level::Low => b"0",
            Level::High => b"1",
        };
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(token))
            .map_err(|e| Error::invalid_resource(format!("gpio{}/value", self.line), e))
    }

    pub(crate) fn set_edge(&mut self, edge: Edge) -> Result<()> {
        self.write_attr("edge", &edge.to_string())
    }

    pub(crate) fn set_active_low(&mut self, active_low: bool) -> Result<()> {
        self.write_attr("active_low", if active_low { "1" } else { "0" })
    }

    /// Pin drive strength, exposed only by some SoCs; absence of the
    /// attribute means the hardware has no drive control.
    pub(crate) fn set_drive(&mut self, token: &str) -> Result<()> {
        let path = self.attr_path("drive");
        if !path.exists() {
            return Err(Error::FeatureNotSupported(format!(
                "line {} has no drive attribute",
                self.line
            )));
        }
        self.write_attr("drive", token)
    }

    /// Fresh descriptor on the value file for an interrupt thread.
    pub(crate) fn event_file(&self) -> Result<File> {
        let path = self.attr_path("value");
        OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))
    }

    pub(crate) fn unexport(&self) -> Result<()> {
        let path = self.root.join("unexport");
        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))?;
        f.write_all(self.line.to_string().as_bytes())
            .map_err(|e| Error::invalid_resource(path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_root(lines: &[u32]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        fs::write(dir.path().join("unexport"), "").unwrap();
        for line in lines {
            let pin_dir = dir.path().join(format!("gpio{line}"));
            fs::create_dir(&pin_dir).unwrap();
            fs::write(pin_dir.join("direction"), "in\n").unwrap();
            fs::write(pin_dir.join("value"), "0\n").unwrap();
            fs::write(pin_dir.join("edge"), "none\n").unwrap();
            fs::write(pin_dir.join("active_low"), "0\n").unwrap();
        }
        dir
    }

    #[test]
    fn test_export_then_read_write() {
        let root = fake_root(&[7]);
        let mut line = SysfsLine::export(root.path(), 7).unwrap();
        assert!(line.exported_here());
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "7");

        line.set_direction(Direction::Out).unwrap();
        line.write(Level::High).unwrap();
        assert_eq!(line.read().unwrap(), Level::High);
        assert_eq!(line.direction().unwrap(), Direction::Out);
    }

    #[test]
    fn test_missing_value_file_is_invalid_resource() {
        let root = fake_root(&[]);
        let err = SysfsLine::export(root.path(), 3).unwrap_err();
        assert!(matches!(err, Error::InvalidResource { .. }));
    }

    #[test]
    fn test_malformed_value_is_unspecified() {
        let root = fake_root(&[2]);
        fs::write(root.path().join("gpio2").join("value"), "x").unwrap();
        let mut line = SysfsLine::export(root.path(), 2).unwrap();
        assert!(matches!(line.read(), Err(Error::Unspecified(_))));
    }

    #[test]
    fn test_drive_absent_is_not_supported() {
        let root = fake_root(&[2]);
        let mut line = SysfsLine::export(root.path(), 2).unwrap();
        assert!(matches!(
            line.set_drive("strong"),
            Err(Error::FeatureNotSupported(_))
        ));
    }
}
