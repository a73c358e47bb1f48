//! # mempin-core
//!
//! Instruction and memory-access profiling tools that run underneath a
//! dynamic binary instrumentation engine. One tool is selected per run; it
//! registers callbacks with the engine, accumulates statistics while the
//! profiled program executes and writes them out when the program exits.
//!
//! ## Architecture
//!
//! - [`host`]: [`InstrumentationHost`], the capability interface to the engine
//! - [`sim`]: [`SimHost`], a deterministic replay host for tests and the CLI
//! - [`sink`]: [`OutputSink`], the serialized output stream shared by all tools
//! - [`threads`]: per-thread statistics arena ([`ThreadStorage`], [`ThreadStat`])
//! - [`routines`]: per-routine statistics registry ([`RoutineRegistry`])
//! - [`tools`]: [`ToolRegistry`] and the four tools
//! - [`report`]: report rows and their CSV / fixed-width text formats
//! - [`archive`]: compressed binary archive of a final report
//! - [`config`]: output naming and tool selection
//!
//! ## Tools
//!
//! | Id | Name | Output |
//! |----|------|--------|
//! | 0 | `inscount` | `Id,Instructions` per thread |
//! | 1 | `inscount_ext` | `Id,Instructions,Reads,Writes,Branches,FloatPoint` per thread |
//! | 2 | `proccount` | `Procedure Image Address Calls Instructions` per routine |
//! | 3 | `malloctrace` | thread and `malloc` event log |

pub mod archive;
pub mod config;
pub mod error;
pub mod host;
pub mod report;
pub mod routines;
pub mod sim;
pub mod sink;
pub mod threads;
pub mod tools;

pub use config::Config;
pub use error::{ProfileError, Result};
pub use host::InstrumentationHost;
pub use report::ProfileReport;
pub use routines::RoutineRegistry;
pub use sim::SimHost;
pub use sink::OutputSink;
pub use threads::{ThreadStat, ThreadStorage};
pub use tools::{Tool, ToolEnv, ToolKind, ToolRegistry};
