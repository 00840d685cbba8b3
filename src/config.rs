//! Configuration module.
//!
//! Command-line interface of the `xld` runner, parsed with `clap`.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::binary::Format;
use crate::loader::BindMode;

/// Loads an ELF, Mach-O or PE binary into this process and runs it.
///
/// The entrypoint (or `--symbol`) is called like `main(argc, argv)` and its return value
/// becomes the exit code.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Binary to load
    #[arg(value_name = "BINARY")]
    pub binary: PathBuf,

    /// Arguments passed to the loaded program
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[arg(long, value_enum, default_value_t = FormatArg::Auto, help = "Binary format")]
    pub format: FormatArg,

    #[arg(long, value_enum, default_value_t = BindArg::Default, help = "When imports are bound")]
    pub bind: BindArg,

    /// Call this exported symbol instead of the entrypoint
    #[arg(long, value_name = "NAME")]
    pub symbol: Option<String>,

    /// Preferred load address (hex with 0x, or decimal)
    #[arg(long, value_name = "ADDR", value_parser = parse_address)]
    pub base: Option<u64>,

    /// Extra shared library searched for imports (repeatable)
    #[arg(long = "lib", value_name = "PATH")]
    pub libs: Vec<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Auto,
    Elf,
    Macho,
    Pe,
}

impl FormatArg {
    /// The forced format, `None` for detection.
    pub fn format(self) -> Option<Format> {
        match self {
            FormatArg::Auto => None,
            FormatArg::Elf => Some(Format::Elf),
            FormatArg::Macho => Some(Format::MachO),
            FormatArg::Pe => Some(Format::Pe),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BindArg {
    Default,
    Now,
    Lazy,
    NotBind,
}

impl From<BindArg> for BindMode {
    fn from(arg: BindArg) -> Self {
        match arg {
            BindArg::Default => BindMode::Default,
            BindArg::Now => BindMode::Now,
            BindArg::Lazy => BindMode::Lazy,
            BindArg::NotBind => BindMode::NotBind,
        }
    }
}

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{}`: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["xld", "./a.out"]).unwrap();
        assert_eq!(config.binary, PathBuf::from("./a.out"));
        assert!(config.args.is_empty());
        assert_eq!(config.format.format(), None);
        assert_eq!(BindMode::from(config.bind), BindMode::Default);
        assert_eq!(config.symbol, None);
        assert_eq!(config.base, None);
        assert!(config.libs.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn options_and_trailing_args() {
        let config = Config::try_parse_from([
            "xld",
            "--format",
            "macho",
            "--bind",
            "not-bind",
            "--symbol",
            "main",
            "--base",
            "0x7000000",
            "--lib",
            "libfoo.so",
            "--lib",
            "libbar.so",
            "prog",
            "-v",
            "--flag",
            "x",
        ])
        .unwrap();
        assert_eq!(config.format.format(), Some(Format::MachO));
        assert_eq!(BindMode::from(config.bind), BindMode::NotBind);
        assert_eq!(config.symbol.as_deref(), Some("main"));
        assert_eq!(config.base, Some(0x700_0000));
        assert_eq!(config.libs.len(), 2);
        assert_eq!(config.binary, PathBuf::from("prog"));
        assert_eq!(config.args, ["-v", "--flag", "x"]);
    }

    #[test]
    fn addresses() {
        assert_eq!(parse_address("4096"), Ok(4096));
        assert_eq!(parse_address("0X1000"), Ok(0x1000));
        assert!(parse_address("0xzz").is_err());
        assert!(Config::try_parse_from(["xld", "--bind", "sometimes", "a"]).is_err());
    }
}
