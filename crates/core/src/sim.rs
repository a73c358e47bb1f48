//! Deterministic replay host.
//!
//! [`SimHost`] implements [`InstrumentationHost`] by replaying a scripted
//! [`Program`] instead of running real machine code. It drives the same
//! callback protocol a JIT engine would:
//!
//! - Image load runs image callbacks, then routine callbacks for every routine
//! - A block and its instructions are instrumented the first time the block
//!   executes; the result is cached until the owning image is unloaded
//! - A call fires routine-entry probes, then for each block its block probes
//!   and for each instruction the routine-instruction probes, unconditional
//!   instruction probes and (if the predicate holds) predicated probes, then
//!   routine-exit probes
//! - At the end of the script, threads still alive get their thread-fini
//!   callbacks (exit code of the program), then every fini callback runs once
//!
//! Programs can be built in code or loaded from JSON:
//!
//! ```text
//! {
//!   "pid": 4242,
//!   "images": [{ "name": "/usr/lib/libc.so.6", "routines": [
//!     { "name": "malloc", "address": 4096,
//!       "blocks": [{ "instructions": [{ "mem": ["read"] }, { "branch": true, "taken": true }] }] }
//!   ]}],
//!   "script": [
//!     { "load": "/usr/lib/libc.so.6" },
//!     { "start": 0 },
//!     { "call": { "thread": 0, "routine": 4096, "arg": 64, "ret": 8192 } },
//!     { "parallel": [[{ "start": 1 }], [{ "start": 2 }]] }
//!   ],
//!   "exit_code": 0
//! }
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProfileError, Result};
use crate::host::*;

// ─── Program model ──────────────────────────────────────────────────────────

fn yes() -> bool { true }
fn once() -> u64 { 1 }

/// An instruction plus its scripted runtime behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimInstruction {
    #[serde(default)]
    pub address: u64,
    /// Direct branch or call
    #[serde(default)]
    pub branch: bool,
    #[serde(default)]
    pub predicated: bool,
    #[serde(default)]
    pub mem: Vec<MemOperand>,
    /// Branch outcome on every execution
    #[serde(default)]
    pub taken: bool,
    /// Predicate outcome on every execution
    #[serde(default = "yes")]
    pub executes: bool,
}

impl SimInstruction {
    pub fn plain() -> Self {
        SimInstruction { executes: true, ..Default::default() }
    }

    pub fn branch(taken: bool) -> Self {
        SimInstruction { branch: true, taken, ..Self::plain() }
    }

    pub fn predicated(executes: bool) -> Self {
        Self::plain().with_predicate(executes)
    }

    pub fn mem(ops: &[MemOperand]) -> Self {
        Self::plain().with_mem(ops)
    }

    pub fn with_predicate(mut self, executes: bool) -> Self {
        self.predicated = true;
        self.executes = executes;
        self
    }

    pub fn with_mem(mut self, ops: &[MemOperand]) -> Self {
        self.mem = ops.to_vec();
        self
    }

    fn to_instruction(&self) -> Instruction {
        Instruction {
            address: self.address,
            direct_branch_or_call: self.branch,
            predicated: self.predicated,
            mem_operands: self.mem.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimBlock {
    #[serde(default)]
    pub address: u64,
    pub instructions: Vec<SimInstruction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRoutine {
    pub name: String,
    pub address: u64,
    pub blocks: Vec<SimBlock>,
}

impl SimRoutine {
    /// Routine whose blocks and instructions are laid out contiguously from
    /// `address`, four bytes per instruction.
    pub fn new(name: &str, address: u64, blocks: Vec<Vec<SimInstruction>>) -> Self {
        let mut pc = address;
        let blocks = blocks.into_iter().map(|ins| {
            let start = pc;
            let instructions = ins.into_iter().map(|mut i| {
                i.address = pc;
                pc += 4;
                i
            }).collect();
            SimBlock { address: start, instructions }
        }).collect();
        SimRoutine { name: name.into(), address, blocks }
    }

    fn to_routine(&self, image: &str) -> Routine {
        Routine {
            name: self.name.clone(),
            address: self.address,
            image: image.into(),
            blocks: self.blocks.iter().map(|b| BasicBlock {
                address: b.address,
                instructions: b.instructions.iter().map(SimInstruction::to_instruction).collect(),
            }).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimImage {
    pub name: String,
    pub routines: Vec<SimRoutine>,
}

impl SimImage {
    pub fn new(name: &str, routines: Vec<SimRoutine>) -> Self {
        SimImage { name: name.into(), routines }
    }

    fn to_image(&self) -> Image {
        Image {
            name: self.name.clone(),
            routines: self.routines.iter().map(|r| r.to_routine(&self.name)).collect(),
        }
    }
}

/// One step of the replay script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Load the image with this path
    Load(String),
    Unload(String),
    /// Start a thread
    Start(u32),
    /// Run a routine to completion `times` times
    Call {
        thread: u32,
        routine: u64,
        #[serde(default)]
        arg: u64,
        #[serde(default)]
        ret: u64,
        #[serde(default = "once")]
        times: u64,
    },
    /// End a thread with an exit code
    End { thread: u32, code: i32 },
    /// Run each sub-script on its own OS thread, then join them all
    Parallel(Vec<Vec<Event>>),
}

impl Event {
    pub fn call(thread: u32, routine: u64) -> Self {
        Event::Call { thread, routine, arg: 0, ret: 0, times: 1 }
    }

    pub fn times(mut self, n: u64) -> Self {
        if let Event::Call { times, .. } = &mut self { *times = n; }
        self
    }

    pub fn arg(mut self, v: u64) -> Self {
        if let Event::Call { arg, .. } = &mut self { *arg = v; }
        self
    }

    pub fn ret(mut self, v: u64) -> Self {
        if let Event::Call { ret, .. } = &mut self { *ret = v; }
        self
    }
}

/// A scripted program run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub images: Vec<SimImage>,
    #[serde(default)]
    pub script: Vec<Event>,
    #[serde(default)]
    pub exit_code: i32,
}

impl Program {
    pub fn new(pid: u32) -> Self {
        Program { pid, ..Default::default() }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn image(mut self, image: SimImage) -> Self {
        self.images.push(image);
        self
    }

    pub fn event(mut self, event: Event) -> Self {
        self.script.push(event);
        self
    }
}

// ─── Host ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Hooks {
    thread_start: Vec<ThreadStartFn>,
    thread_fini: Vec<ThreadFiniFn>,
    blocks: Vec<BlockInstrumentFn>,
    instructions: Vec<InsInstrumentFn>,
    routines: Vec<RoutineInstrumentFn>,
    images: Vec<ImageInstrumentFn>,
}

impl Hooks {
    fn len(&self) -> usize {
        self.thread_start.len() + self.thread_fini.len() + self.blocks.len()
            + self.instructions.len() + self.routines.len() + self.images.len()
    }
}

/// Replay host; see the module docs.
pub struct SimHost {
    pid: u32,
    hooks: Hooks,
    fini: Vec<FiniFn>,
}

impl SimHost {
    pub fn new(pid: u32) -> Self {
        SimHost { pid, hooks: Hooks::default(), fini: Vec::new() }
    }

    /// Total number of callbacks registered so far.
    pub fn registered_callbacks(&self) -> usize {
        self.hooks.len() + self.fini.len()
    }

    /// Replay `program`, then run fini callbacks. Returns the exit code.
    pub fn run(self, program: &Program) -> Result<i32> {
        let SimHost { hooks, fini, .. } = self;
        let machine = Machine { program, hooks: &hooks, state: Mutex::new(State::default()) };
        machine.run_script(&program.script)?;

        let live: Vec<u32> = machine.state.lock().live.iter().copied().collect();
        for tid in live {
            machine.end_thread(tid, program.exit_code)?;
        }
        debug!("sim: program {} exited with code {}", program.pid, program.exit_code);
        for f in fini {
            f(program.exit_code);
        }
        Ok(program.exit_code)
    }
}

impl InstrumentationHost for SimHost {
    fn pid(&self) -> u32 { self.pid }

    fn on_thread_start(&mut self, f: ThreadStartFn) { self.hooks.thread_start.push(f); }

    fn on_thread_fini(&mut self, f: ThreadFiniFn) { self.hooks.thread_fini.push(f); }

    fn on_fini(&mut self, f: FiniFn) { self.fini.push(f); }

    fn instrument_blocks(&mut self, f: BlockInstrumentFn) { self.hooks.blocks.push(f); }

    fn instrument_instructions(&mut self, f: InsInstrumentFn) { self.hooks.instructions.push(f); }

    fn instrument_routines(&mut self, f: RoutineInstrumentFn) { self.hooks.routines.push(f); }

    fn instrument_images(&mut self, f: ImageInstrumentFn) { self.hooks.images.push(f); }
}

// ─── Replay machinery ───────────────────────────────────────────────────────

/// Code cache key: (image load generation, routine address, block index).
type BlockKey = (u64, u64, usize);

struct CompiledIns {
    always: Vec<Analysis>,
    predicated: Vec<Analysis>,
}

struct CompiledBlock {
    calls: Vec<Analysis>,
    ins: Vec<CompiledIns>,
}

struct CompiledRoutine {
    generation: u64,
    image: Arc<Image>,
    /// Index into `image.routines` and into the program image's routines
    index: usize,
    /// Program image index
    source: usize,
    before: Vec<Analysis>,
    after: Vec<Analysis>,
    /// Probes per instruction index
    per_ins: Vec<Vec<Analysis>>,
}

struct LoadedImage {
    generation: u64,
    routines: HashMap<u64, Arc<CompiledRoutine>>,
}

#[derive(Default)]
struct State {
    generation: u64,
    loaded: HashMap<String, LoadedImage>,
    started: HashSet<u32>,
    live: BTreeSet<u32>,
    code_cache: HashMap<BlockKey, Arc<CompiledBlock>>,
}

struct Machine<'a> {
    program: &'a Program,
    hooks: &'a Hooks,
    state: Mutex<State>,
}

fn fire(calls: &[Analysis], args: &ProbeArgs) {
    for call in calls {
        call(args);
    }
}

impl<'a> Machine<'a> {
    fn run_script(&self, events: &[Event]) -> Result<()> {
        for event in events {
            match event {
                Event::Load(name) => self.load(name)?,
                Event::Unload(name) => self.unload(name)?,
                Event::Start(tid) => self.start_thread(*tid)?,
                Event::Call { thread, routine, arg, ret, times } => {
                    self.call(*thread, *routine, *arg, *ret, *times)?
                }
                Event::End { thread, code } => self.end_thread(*thread, *code)?,
                Event::Parallel(scripts) => self.run_parallel(scripts)?,
            }
        }
        Ok(())
    }

    fn run_parallel(&self, scripts: &[Vec<Event>]) -> Result<()> {
        std::thread::scope(|s| {
            let handles: Vec<_> = scripts.iter()
                .map(|script| s.spawn(move || self.run_script(script)))
                .collect();
            let mut first_err = None;
            for h in handles {
                let res = match h.join() {
                    Ok(res) => res,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                if let Err(e) = res {
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }

    fn start_thread(&self, tid: u32) -> Result<()> {
        {
            let mut st = self.state.lock();
            if !st.started.insert(tid) {
                return Err(ProfileError::ThreadRestarted(tid));
            }
            st.live.insert(tid);
        }
        for f in &self.hooks.thread_start {
            f(ThreadId(tid));
        }
        Ok(())
    }

    fn end_thread(&self, tid: u32, code: i32) -> Result<()> {
        if !self.state.lock().live.remove(&tid) {
            return Err(ProfileError::ThreadNotStarted(tid));
        }
        for f in &self.hooks.thread_fini {
            f(ThreadId(tid), code);
        }
        Ok(())
    }

    fn load(&self, name: &str) -> Result<()> {
        let source = self.program.images.iter()
            .position(|img| img.name == name)
            .ok_or_else(|| ProfileError::UnknownImage(name.into()))?;

        // Instrumentation is serialized, as under a JIT lock.
        let mut st = self.state.lock();
        if st.loaded.contains_key(name) {
            warn!("sim: image {} is already loaded", name);
            return Ok(());
        }
        st.generation += 1;
        let generation = st.generation;
        let image = Arc::new(self.program.images[source].to_image());

        let mut img_probes = ImageProbes::default();
        for f in &self.hooks.images {
            f(&image, &mut img_probes);
        }
        let mut from_image = img_probes.into_routines();

        let mut routines = HashMap::new();
        for (index, rtn) in image.routines.iter().enumerate() {
            let mut probes = from_image.remove(&rtn.address).unwrap_or_default();
            for f in &self.hooks.routines {
                f(rtn, &mut probes);
            }
            let set = probes.into_set();
            let mut per_ins: Vec<Vec<Analysis>> = vec![Vec::new(); rtn.num_ins()];
            for (i, probe) in set.per_ins {
                match per_ins.get_mut(i) {
                    Some(slot) => slot.push(probe),
                    None => warn!("sim: {} has no instruction {}", rtn.name, i),
                }
            }
            routines.insert(rtn.address, Arc::new(CompiledRoutine {
                generation,
                image: image.clone(),
                index,
                source,
                before: set.before,
                after: set.after,
                per_ins,
            }));
        }
        debug!("sim: loaded {} ({} routines, generation {})", name, routines.len(), generation);
        st.loaded.insert(name.into(), LoadedImage { generation, routines });
        Ok(())
    }

    fn unload(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        let img = st.loaded.remove(name).ok_or_else(|| ProfileError::ImageNotLoaded(name.into()))?;
        st.code_cache.retain(|key, _| key.0 != img.generation);
        debug!("sim: unloaded {}", name);
        Ok(())
    }

    fn routine(&self, address: u64) -> Result<Arc<CompiledRoutine>> {
        let st = self.state.lock();
        st.loaded.values()
            .find_map(|img| img.routines.get(&address).cloned())
            .ok_or(ProfileError::UnknownRoutine(address))
    }

    /// Compiled form of a block, instrumenting it on first execution.
    fn block(&self, rtn: &CompiledRoutine, index: usize) -> Arc<CompiledBlock> {
        let routine = &rtn.image.routines[rtn.index];
        let key = (rtn.generation, routine.address, index);
        let mut st = self.state.lock();
        if let Some(block) = st.code_cache.get(&key) {
            return block.clone();
        }

        let bbl = &routine.blocks[index];
        let mut probes = BlockProbes::default();
        for f in &self.hooks.blocks {
            f(bbl, &mut probes);
        }
        let ins = bbl.instructions.iter().map(|i| {
            let mut probes = InsProbes::default();
            for f in &self.hooks.instructions {
                f(i, &mut probes);
            }
            let (always, predicated) = probes.into_parts();
            CompiledIns { always, predicated }
        }).collect();

        let block = Arc::new(CompiledBlock { calls: probes.into_calls(), ins });
        st.code_cache.insert(key, block.clone());
        block
    }

    fn call(&self, thread: u32, address: u64, arg: u64, ret: u64, times: u64) -> Result<()> {
        if !self.state.lock().live.contains(&thread) {
            return Err(ProfileError::ThreadNotStarted(thread));
        }
        let rtn = self.routine(address)?;
        let source = &self.program.images[rtn.source].routines[rtn.index];
        let tid = ThreadId(thread);

        for _ in 0..times {
            fire(&rtn.before, &ProbeArgs { thread: tid, arg0: arg, ..Default::default() });
            let mut ins_index = 0;
            for (bi, sim_block) in source.blocks.iter().enumerate() {
                let block = self.block(&rtn, bi);
                let plain = ProbeArgs { thread: tid, ..Default::default() };
                fire(&block.calls, &plain);
                for (sim_ins, compiled) in sim_block.instructions.iter().zip(&block.ins) {
                    fire(&rtn.per_ins[ins_index], &plain);
                    fire(&compiled.always, &ProbeArgs { branch_taken: sim_ins.taken, ..plain });
                    if sim_ins.executes {
                        fire(&compiled.predicated, &plain);
                    }
                    ins_index += 1;
                }
            }
            fire(&rtn.after, &ProbeArgs { thread: tid, ret, ..Default::default() });
        }
        Ok(())
    }
}
