//! Load-command configuration options.
//!
//! The grammar is DOS-style keyword arguments, not GNU flags: `io=0x300`,
//! `irq=10`, `dma=auto`, `pio`, `log=file=driver.log`, `buffers=large`,
//! space-separated, order-independent.

use anyhow::{bail, Result};

/// How the operator wants the DMA policy's `runtime_enable` seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaSetting {
    /// `dma=on`.
    On,
    /// `dma=off`.
    Off,
    /// `dma=auto` or unspecified: seed from the persisted policy record.
    Auto,
}

/// Logging sink selection (§6: `log={on|off|file=<path>|noconsole|network}`).
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Logging is enabled at all.
    pub enabled: bool,
    /// Console sink suppressed even if `enabled`.
    pub noconsole: bool,
    /// Network sink requested.
    pub network: bool,
    /// File sink path, if `log=file=<path>` was given.
    pub file: Option<String>,
}

/// Pool-size-class multiplier (§6: `buffers={small|standard|large}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferClass {
    Small,
    #[default]
    Standard,
    Large,
}

/// Fully parsed configuration for one load attempt.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// `io=<hex>` override.
    pub io_base: Option<u16>,
    /// `irq=<decimal>` override.
    pub irq: Option<u8>,
    /// `dma={on|off|auto}`.
    pub dma: Option<DmaSetting>,
    /// `pio`: force PIO and lock it (equivalent to `dma=off`, irreversible
    /// for this load).
    pub force_pio: bool,
    /// `log=...`.
    pub log: LogConfig,
    /// `buffers={small|standard|large}`.
    pub buffers: BufferClass,
}

impl Config {
    /// Parses `args` (excluding argv[0]) into a [`Config`].
    ///
    /// # Errors
    ///
    /// Returns an error naming the first argument that is not a recognized
    /// keyword, or whose value fails to parse.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut config = Self::default();
        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (arg.as_str(), None),
            };
            match (key, value) {
                ("io", Some(v)) => {
                    let digits = v.strip_prefix("0x").unwrap_or(v);
                    config.io_base = Some(
                        u16::from_str_radix(digits, 16).map_err(|_| anyhow::anyhow!("invalid io= value: {v}"))?,
                    );
                }
                ("irq", Some(v)) => {
                    config.irq = Some(v.parse().map_err(|_| anyhow::anyhow!("invalid irq= value: {v}"))?);
                }
                ("dma", Some("on")) => config.dma = Some(DmaSetting::On),
                ("dma", Some("off")) => config.dma = Some(DmaSetting::Off),
                ("dma", Some("auto")) => config.dma = Some(DmaSetting::Auto),
                ("dma", Some(v)) => bail!("invalid dma= value: {v}"),
                ("pio", None) => config.force_pio = true,
                ("log", Some(v)) => apply_log_value(&mut config.log, v)?,
                ("log", None) => bail!("log= requires a value"),
                ("buffers", Some("small")) => config.buffers = BufferClass::Small,
                ("buffers", Some("standard")) => config.buffers = BufferClass::Standard,
                ("buffers", Some("large")) => config.buffers = BufferClass::Large,
                ("buffers", Some(v)) => bail!("invalid buffers= value: {v}"),
                _ => bail!("unrecognized option: {arg}"),
            }
        }
        Ok(config)
    }
}

fn apply_log_value(log: &mut LogConfig, value: &str) -> Result<()> {
    match value {
        "on" => log.enabled = true,
        "off" => log.enabled = false,
        "noconsole" => {
            log.enabled = true;
            log.noconsole = true;
        }
        "network" => {
            log.enabled = true;
            log.network = true;
        }
        _ => {
            let Some(path) = value.strip_prefix("file=") else {
                bail!("invalid log= value: {value}");
            };
            log.enabled = true;
            log.file = Some(path.to_string());
        }
    }
    Ok(())
}
