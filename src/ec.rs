//! Embedded controller access.
//!
//! Four interchangeable backends share one capability set: the `ec_sys`
//! debugfs file, the `acpi_ec` character device, raw port I/O through
//! `/dev/port`, and an in-memory dummy used by tests and dry runs. The
//! `--debug` flag wraps the selected backend in [`TraceEc`], which logs
//! every register operation before forwarding it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Context, Error, Result};

pub const EC_SYS_PATH: &str = "/sys/kernel/debug/ec/ec0/io";
pub const ACPI_EC_PATH: &str = "/dev/ec";
pub const DEV_PORT_PATH: &str = "/dev/port";

// Standard EC ports and handshake protocol bytes.
const EC_DATA_PORT: u64 = 0x62;
const EC_COMMAND_PORT: u64 = 0x66;
const EC_CMD_READ: u8 = 0x80;
const EC_CMD_WRITE: u8 = 0x81;
const EC_STATUS_OBF: u8 = 0x01;
const EC_STATUS_IBF: u8 = 0x02;
// Iteration cap for the OBF/IBF busy-poll.
const EC_POLL_MAX: u32 = 100;

/// Which backend talks to the EC. The string forms are what the service
/// config and the `--embedded-controller` flag accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcKind {
    #[serde(rename = "ec_sys", alias = "ec_sys_linux")]
    EcSys,
    #[serde(rename = "acpi_ec", alias = "ec_acpi")]
    AcpiEc,
    #[serde(rename = "dev_port", alias = "ec_linux")]
    DevPort,
    #[serde(rename = "dummy")]
    Dummy,
}

impl fmt::Display for EcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EcKind::EcSys => "ec_sys",
            EcKind::AcpiEc => "acpi_ec",
            EcKind::DevPort => "dev_port",
            EcKind::Dummy => "dummy",
        };
        f.write_str(s)
    }
}

impl FromStr for EcKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ec_sys" | "ec_sys_linux" => Ok(EcKind::EcSys),
            "acpi_ec" | "ec_acpi" => Ok(EcKind::AcpiEc),
            "dev_port" | "ec_linux" => Ok(EcKind::DevPort),
            "dummy" => Ok(EcKind::Dummy),
            _ => Err(format!("invalid embedded controller type: {s}")),
        }
    }
}

/// The EC register space as 8-bit read/write capabilities. Word access
/// is little-endian over two consecutive registers; a failed byte
/// surfaces as a word error.
pub trait EmbeddedController: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn read_byte(&mut self, register: u8) -> Result<u8>;
    fn write_byte(&mut self, register: u8, value: u8) -> Result<()>;

    fn read_word(&mut self, register: u8) -> Result<u16> {
        let lo = self.read_byte(register)?;
        let hi = self.read_byte(register.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn write_word(&mut self, register: u8, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.write_byte(register, lo)?;
        self.write_byte(register.wrapping_add(1), hi)
    }
}

/// Positional byte access through a kernel-provided EC device file.
/// Covers both the `ec_sys` debugfs file and the `acpi_ec` character
/// device, which expose the register space at byte offsets.
pub struct FileEc {
    path: PathBuf,
    file: Option<File>,
}

impl FileEc {
    pub fn ec_sys() -> Self {
        Self::at(EC_SYS_PATH)
    }

    pub fn acpi_ec() -> Self {
        Self::at(ACPI_EC_PATH)
    }

    pub fn at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::Ec("embedded controller not open".to_string()))
    }
}

impl EmbeddedController for FileEc {
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .context(self.path.display().to_string())?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn read_byte(&mut self, register: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file()?
            .read_exact_at(&mut buf, u64::from(register))
            .context(format!("EC read at 0x{register:02x}"))?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<()> {
        self.file()?
            .write_all_at(&[value], u64::from(register))
            .context(format!("EC write at 0x{register:02x}"))?;
        Ok(())
    }
}

/// Raw port I/O through `/dev/port` at the standard EC command/data
/// ports, implementing the EC handshake protocol with a bounded
/// busy-poll on the status flags.
pub struct DevPort {
    file: Option<File>,
}

impl DevPort {
    pub fn new() -> Self {
        Self { file: None }
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::Ec("embedded controller not open".to_string()))
    }

    fn port_read(file: &File, port: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        file.read_exact_at(&mut buf, port)
            .context(format!("port read at 0x{port:02x}"))?;
        Ok(buf[0])
    }

    fn port_write(file: &File, port: u64, value: u8) -> Result<()> {
        file.write_all_at(&[value], port)
            .context(format!("port write at 0x{port:02x}"))?;
        Ok(())
    }

    /// Wait until the input buffer is free before sending a byte.
    fn wait_ibf_clear(file: &File) -> Result<()> {
        for _ in 0..EC_POLL_MAX {
            if Self::port_read(file, EC_COMMAND_PORT)? & EC_STATUS_IBF == 0 {
                return Ok(());
            }
            thread::sleep(Duration::from_micros(100));
        }
        Err(Error::Ec("timed out waiting for EC input buffer".to_string()))
    }

    /// Wait until the output buffer holds a byte for us.
    fn wait_obf_set(file: &File) -> Result<()> {
        for _ in 0..EC_POLL_MAX {
            if Self::port_read(file, EC_COMMAND_PORT)? & EC_STATUS_OBF != 0 {
                return Ok(());
            }
            thread::sleep(Duration::from_micros(100));
        }
        Err(Error::Ec("timed out waiting for EC output buffer".to_string()))
    }

    fn send(file: &File, port: u64, value: u8) -> Result<()> {
        Self::wait_ibf_clear(file)?;
        Self::port_write(file, port, value)
    }
}

impl Default for DevPort {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedController for DevPort {
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEV_PORT_PATH)
            .context(DEV_PORT_PATH)?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn read_byte(&mut self, register: u8) -> Result<u8> {
        let file = self.file()?;
        Self::send(file, EC_COMMAND_PORT, EC_CMD_READ)?;
        Self::send(file, EC_DATA_PORT, register)?;
        Self::wait_obf_set(file)?;
        Self::port_read(file, EC_DATA_PORT)
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<()> {
        let file = self.file()?;
        Self::send(file, EC_COMMAND_PORT, EC_CMD_WRITE)?;
        Self::send(file, EC_DATA_PORT, register)?;
        Self::send(file, EC_DATA_PORT, value)
    }
}

/// In-memory EC: a 256-byte register file. Used by the test suite and
/// for dry runs on machines without a supported controller.
pub struct DummyEc {
    registers: [u8; 256],
}

impl DummyEc {
    pub fn new() -> Self {
        Self {
            registers: [0u8; 256],
        }
    }
}

impl Default for DummyEc {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedController for DummyEc {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn read_byte(&mut self, register: u8) -> Result<u8> {
        Ok(self.registers[usize::from(register)])
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<()> {
        self.registers[usize::from(register)] = value;
        Ok(())
    }
}

/// Decorator logging every EC operation before forwarding it.
pub struct TraceEc {
    inner: Box<dyn EmbeddedController>,
}

impl TraceEc {
    pub fn new(inner: Box<dyn EmbeddedController>) -> Self {
        Self { inner }
    }
}

impl EmbeddedController for TraceEc {
    fn open(&mut self) -> Result<()> {
        debug!("ec: open");
        self.inner.open()
    }

    fn close(&mut self) {
        debug!("ec: close");
        self.inner.close();
    }

    fn read_byte(&mut self, register: u8) -> Result<u8> {
        let value = self.inner.read_byte(register)?;
        debug!(register, value, "ec: read byte");
        Ok(value)
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<()> {
        debug!(register, value, "ec: write byte");
        self.inner.write_byte(register, value)
    }
}

pub fn controller_for(kind: EcKind) -> Box<dyn EmbeddedController> {
    match kind {
        EcKind::EcSys => Box::new(FileEc::ec_sys()),
        EcKind::AcpiEc => Box::new(FileEc::acpi_ec()),
        EcKind::DevPort => Box::new(DevPort::new()),
        EcKind::Dummy => Box::new(DummyEc::new()),
    }
}

/// Probe `ec_sys`, then `acpi_ec`, then `dev_port`. The first backend
/// whose `open()` succeeds wins and is returned already open.
pub fn find_working() -> Result<(EcKind, Box<dyn EmbeddedController>)> {
    for kind in [EcKind::EcSys, EcKind::AcpiEc, EcKind::DevPort] {
        let mut ec = controller_for(kind);
        match ec.open() {
            Ok(()) => {
                info!(%kind, "embedded controller backend selected");
                return Ok((kind, ec));
            }
            Err(e) => debug!(%kind, error = %e.chain(), "backend probe failed"),
        }
    }
    Err(Error::Ec(
        "no working embedded controller backend found".to_string(),
    ))
}
