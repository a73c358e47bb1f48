//! Capability interface to the dynamic binary instrumentation engine.
//!
//! The engine owns program loading, code rewriting and callback dispatch.
//! Tools only see it through [`InstrumentationHost`]:
//!
//! - **Lifecycle callbacks**: thread start, thread end, process exit
//! - **Instrumentation callbacks**: invoked once per newly discovered block,
//!   instruction, routine or image, at instrumentation time
//! - **Probes**: [`Analysis`] closures that an instrumentation callback asks
//!   the engine to run at execution time, every time the code runs
//!
//! Static code objects ([`BasicBlock`], [`Instruction`], [`Routine`],
//! [`Image`]) are only lent to instrumentation callbacks. The engine may drop
//! them as soon as the owning image is unloaded, so a tool has to copy out
//! anything it wants to report later.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Engine thread index. Threads are numbered densely from 0 in start order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    #[inline(always)]
    pub fn index(self) -> usize { self.0 as usize }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Static code model ──────────────────────────────────────────────────────

/// Access performed by one memory operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemOperand {
    Read,
    Write,
    /// Read-modify-write operand (e.g. `incl (%eax)`)
    ReadWrite,
}

impl MemOperand {
    pub fn is_read(self) -> bool {
        matches!(self, MemOperand::Read | MemOperand::ReadWrite)
    }

    pub fn is_written(self) -> bool {
        matches!(self, MemOperand::Write | MemOperand::ReadWrite)
    }
}

/// One decoded instruction, classified by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    /// Direct (target-encoded) branch or call
    pub direct_branch_or_call: bool,
    /// Executes conditionally on runtime state (cmov, rep-prefixed, ...)
    pub predicated: bool,
    pub mem_operands: Vec<MemOperand>,
}

/// Straight-line code with one entry and one exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlock {
    pub address: u64,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Static instruction count.
    pub fn num_ins(&self) -> u32 {
        self.instructions.len() as u32
    }
}

/// A named procedure inside a loaded image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routine {
    pub name: String,
    pub address: u64,
    /// Full path of the owning image
    pub image: String,
    pub blocks: Vec<BasicBlock>,
}

impl Routine {
    /// Instructions in program order across all blocks.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn num_ins(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }
}

/// A loaded executable or shared library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub routines: Vec<Routine>,
}

impl Image {
    /// Look up a routine by its exact symbol name.
    pub fn find_routine(&self, name: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| r.name == name)
    }
}

// ─── Probes ─────────────────────────────────────────────────────────────────

/// Runtime values passed to a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeArgs {
    /// Thread executing the instrumented code
    pub thread: ThreadId,
    /// Branch outcome; only meaningful for instruction probes
    pub branch_taken: bool,
    /// First argument; only meaningful at routine entry
    pub arg0: u64,
    /// Return value; only meaningful at routine exit
    pub ret: u64,
}

/// Analysis routine run by a probe.
pub type Analysis = Arc<dyn Fn(&ProbeArgs) + Send + Sync>;

/// Where a routine-level probe fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IPoint {
    /// On routine entry
    Before,
    /// On every routine return
    After,
}

/// Probes requested for one basic block.
#[derive(Default)]
pub struct BlockProbes {
    calls: Vec<Analysis>,
}

impl BlockProbes {
    /// Run `analysis` every time the block executes.
    pub fn insert_call(&mut self, analysis: Analysis) {
        self.calls.push(analysis);
    }

    pub fn into_calls(self) -> Vec<Analysis> {
        self.calls
    }
}

/// Probes requested for one instruction.
#[derive(Default)]
pub struct InsProbes {
    always: Vec<Analysis>,
    predicated: Vec<Analysis>,
}

impl InsProbes {
    /// Run `analysis` before the instruction, whether or not its predicate holds.
    pub fn insert_call(&mut self, analysis: Analysis) {
        self.always.push(analysis);
    }

    /// Run `analysis` before the instruction only if it actually executes.
    pub fn insert_predicated_call(&mut self, analysis: Analysis) {
        self.predicated.push(analysis);
    }

    /// `(unconditional, predicated)` probes in insertion order.
    pub fn into_parts(self) -> (Vec<Analysis>, Vec<Analysis>) {
        (self.always, self.predicated)
    }
}

/// Probes requested for one routine.
#[derive(Default)]
pub struct RoutineProbes {
    before: Vec<Analysis>,
    after: Vec<Analysis>,
    per_ins: Vec<(usize, Analysis)>,
}

/// Drained form of [`RoutineProbes`], consumed by host implementations.
#[derive(Default)]
pub struct RoutineProbeSet {
    pub before: Vec<Analysis>,
    pub after: Vec<Analysis>,
    /// `(instruction index within the routine, probe)`
    pub per_ins: Vec<(usize, Analysis)>,
}

impl RoutineProbes {
    pub fn insert_call(&mut self, point: IPoint, analysis: Analysis) {
        match point {
            IPoint::Before => self.before.push(analysis),
            IPoint::After => self.after.push(analysis),
        }
    }

    /// Run `analysis` before the `index`-th instruction of the routine.
    pub fn insert_ins_call(&mut self, index: usize, analysis: Analysis) {
        self.per_ins.push((index, analysis));
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty() && self.per_ins.is_empty()
    }

    pub fn into_set(self) -> RoutineProbeSet {
        RoutineProbeSet { before: self.before, after: self.after, per_ins: self.per_ins }
    }
}

/// Probes requested while an image is being loaded, keyed by routine address.
#[derive(Default)]
pub struct ImageProbes {
    routines: BTreeMap<u64, RoutineProbes>,
}

impl ImageProbes {
    /// Open `rtn` for probe insertion.
    pub fn routine(&mut self, rtn: &Routine) -> &mut RoutineProbes {
        self.routines.entry(rtn.address).or_default()
    }

    pub fn into_routines(self) -> BTreeMap<u64, RoutineProbes> {
        self.routines
    }
}

// ─── Host ───────────────────────────────────────────────────────────────────

pub type ThreadStartFn = Box<dyn Fn(ThreadId) + Send + Sync>;
pub type ThreadFiniFn = Box<dyn Fn(ThreadId, i32) + Send + Sync>;
pub type FiniFn = Box<dyn FnOnce(i32) + Send>;
pub type BlockInstrumentFn = Box<dyn Fn(&BasicBlock, &mut BlockProbes) + Send + Sync>;
pub type InsInstrumentFn = Box<dyn Fn(&Instruction, &mut InsProbes) + Send + Sync>;
pub type RoutineInstrumentFn = Box<dyn Fn(&Routine, &mut RoutineProbes) + Send + Sync>;
pub type ImageInstrumentFn = Box<dyn Fn(&Image, &mut ImageProbes) + Send + Sync>;

/// What a tool needs from the instrumentation engine.
///
/// Lifecycle and analysis callbacks run synchronously on the thread that
/// triggered them. Fini callbacks run once, after every profiled thread has
/// stopped producing events.
pub trait InstrumentationHost {
    /// Process id of the profiled program.
    fn pid(&self) -> u32;

    fn on_thread_start(&mut self, f: ThreadStartFn);

    /// Receives the thread's exit code.
    fn on_thread_fini(&mut self, f: ThreadFiniFn);

    /// Receives the process exit code.
    fn on_fini(&mut self, f: FiniFn);

    /// Called once per newly encountered basic block.
    fn instrument_blocks(&mut self, f: BlockInstrumentFn);

    /// Called once per newly encountered instruction.
    fn instrument_instructions(&mut self, f: InsInstrumentFn);

    /// Called once per discovered routine.
    fn instrument_routines(&mut self, f: RoutineInstrumentFn);

    /// Called once per loaded image.
    fn instrument_images(&mut self, f: ImageInstrumentFn);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine() -> Routine {
        Routine {
            name: "work".into(),
            address: 0x400,
            image: "/bin/app".into(),
            blocks: vec![
                BasicBlock { address: 0x400, instructions: vec![Instruction::default(); 3] },
                BasicBlock { address: 0x410, instructions: vec![Instruction::default(); 2] },
            ],
        }
    }

    #[test]
    fn test_mem_operand_flags() {
        assert!(MemOperand::Read.is_read() && !MemOperand::Read.is_written());
        assert!(!MemOperand::Write.is_read() && MemOperand::Write.is_written());
        assert!(MemOperand::ReadWrite.is_read() && MemOperand::ReadWrite.is_written());
    }

    #[test]
    fn test_routine_counts() {
        let r = routine();
        assert_eq!(r.num_ins(), 5);
        assert_eq!(r.instructions().count(), 5);
        assert_eq!(r.blocks[0].num_ins(), 3);
    }

    #[test]
    fn test_image_probes_keyed_by_routine() {
        let r = routine();
        let mut probes = ImageProbes::default();
        probes.routine(&r).insert_call(IPoint::Before, Arc::new(|_| {}));
        probes.routine(&r).insert_call(IPoint::After, Arc::new(|_| {}));
        let routines = probes.into_routines();
        assert_eq!(routines.len(), 1);
        let set = routines.into_values().next().unwrap().into_set();
        assert_eq!((set.before.len(), set.after.len()), (1, 1));
    }
}
