//! Tool selection and dispatch.
//!
//! Every analysis tool implements [`Tool`]. The [`ToolRegistry`] keeps tools in
//! registration order and installs exactly one of them: the first whose id
//! matches the requested one. Installing a tool registers its callbacks with
//! the [`InstrumentationHost`]; nothing runs until the host starts the program.
//!
//! | Id | Tool |
//! |----|------|
//! | 0  | [`inscount::InsCount`]: instructions per thread |
//! | 1  | [`inscount::InsCountExt`]: instructions, reads, writes, branches, predicated ops per thread |
//! | 2  | [`proccount::ProcCount`]: calls and instructions per routine |
//! | 3  | [`malloctrace::MallocTrace`]: thread and `malloc` event log |

pub mod inscount;
pub mod malloctrace;
pub mod proccount;

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::archive::save_archive;
use crate::error::{ProfileError, Result};
use crate::host::InstrumentationHost;
use crate::report::ProfileReport;
use crate::sink::OutputSink;

/// The built-in tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    InsCount,
    InsCountExt,
    ProcCount,
    MallocTrace,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::InsCount,
        ToolKind::InsCountExt,
        ToolKind::ProcCount,
        ToolKind::MallocTrace,
    ];

    /// Numeric id used on the command line.
    pub fn id(self) -> i32 {
        match self {
            ToolKind::InsCount => 0,
            ToolKind::InsCountExt => 1,
            ToolKind::ProcCount => 2,
            ToolKind::MallocTrace => 3,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::InsCount => "inscount",
            ToolKind::InsCountExt => "inscount_ext",
            ToolKind::ProcCount => "proccount",
            ToolKind::MallocTrace => "malloctrace",
        }
    }
}

/// Resources shared with the active tool.
#[derive(Clone)]
pub struct ToolEnv {
    pub sink: Arc<OutputSink>,
    /// Where to save the binary report archive, if requested
    pub archive: Option<PathBuf>,
}

impl ToolEnv {
    pub fn new(sink: Arc<OutputSink>) -> Self {
        ToolEnv { sink, archive: None }
    }

    pub fn with_archive(mut self, path: PathBuf) -> Self {
        self.archive = Some(path);
        self
    }

    /// Render `report` and close the sink, then archive it if requested.
    pub fn publish(&self, kind: ToolKind, report: &ProfileReport) {
        self.sink.finish(|w| report.render(w));
        if let Some(path) = &self.archive {
            match save_archive(report, kind, path) {
                Ok(()) => debug!("{} archive saved to {}", kind.name(), path.display()),
                Err(e) => warn!("{} archive {}: {}", kind.name(), path.display(), e),
            }
        }
    }
}

/// An analysis tool.
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Register this tool's callbacks with `host`.
    fn install(&self, host: &mut dyn InstrumentationHost, env: &ToolEnv);

    /// Install the tool if `id` is its own. Returns whether it did.
    fn try_install(&self, id: i32, host: &mut dyn InstrumentationHost, env: &ToolEnv) -> bool {
        if self.kind().id() != id {
            return false;
        }
        info!("registering callbacks for {}", self.kind().name());
        self.install(host, env);
        true
    }
}

/// Ordered list of tools; the first tool accepting an id wins.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry holding every built-in tool in id order.
    pub fn with_default_tools() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(inscount::InsCount));
        reg.register(Box::new(inscount::InsCountExt));
        reg.register(Box::new(proccount::ProcCount));
        reg.register(Box::new(malloctrace::MallocTrace));
        reg
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn len(&self) -> usize { self.tools.len() }

    pub fn is_empty(&self) -> bool { self.tools.is_empty() }

    /// Install the tool registered for `id`.
    pub fn dispatch(&self, id: i32, host: &mut dyn InstrumentationHost, env: &ToolEnv) -> Result<ToolKind> {
        for tool in &self.tools {
            if tool.try_install(id, host, env) {
                return Ok(tool.kind());
            }
        }
        Err(ProfileError::UnknownTool(id))
    }
}
