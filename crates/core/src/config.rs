//! Run configuration: output naming and tool selection.

use std::path::PathBuf;

/// Default output base name.
pub const DEFAULT_OUTPUT: &str = "MemPin.out";

/// Settings chosen on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Output base name; the process id is appended
    pub output: String,
    /// Numeric tool id, resolved by the tool registry
    pub tool: i32,
    /// Also save a binary archive of the final report
    pub archive: bool,
}

impl Config {
    /// `<output>_<pid>`, unique per profiled process.
    pub fn output_path(&self, pid: u32) -> PathBuf {
        PathBuf::from(format!("{}_{}", self.output, pid))
    }

    /// `<output>_<pid>.mpz`
    pub fn archive_path(&self, pid: u32) -> PathBuf {
        PathBuf::from(format!("{}_{}.mpz", self.output, pid))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config { output: DEFAULT_OUTPUT.into(), tool: 0, archive: false }
    }
}
