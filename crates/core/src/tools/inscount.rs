//! Per-thread instruction counters.
//!
//! - [`InsCount`]: retired instructions per thread. Each basic block gets one
//!   probe adding the block's static instruction count, so the cost is one
//!   add per executed block rather than per instruction.
//! - [`InsCountExt`]: the same, plus per-instruction probes for memory reads,
//!   memory writes, taken direct branches/calls and predicated instructions
//!   (an approximation of floating-point-like operations).
//!
//! Counters live in a [`ThreadStorage`] slot owned by the executing thread,
//! so probes never contend. Both tools print one CSV row per started thread
//! when the program exits.

use std::sync::Arc;

use log::{debug, warn};

use crate::host::{Analysis, InstrumentationHost, ProbeArgs};
use crate::report::{thread_rows, ProfileReport};
use crate::threads::{ThreadStat, ThreadStorage};
use crate::tools::{Tool, ToolEnv, ToolKind};

type Threads = Arc<ThreadStorage<ThreadStat>>;

/// Tool 0: instructions per thread.
pub struct InsCount;

/// Tool 1: instructions, reads, writes, taken branches and predicated ops per thread.
pub struct InsCountExt;

impl Tool for InsCount {
    fn kind(&self) -> ToolKind { ToolKind::InsCount }

    fn install(&self, host: &mut dyn InstrumentationHost, env: &ToolEnv) {
        let threads: Threads = Arc::new(ThreadStorage::new());
        install_thread_counting(host, &threads);
        install_block_counting(host, &threads);

        let env = env.clone();
        host.on_fini(Box::new(move |code| {
            debug!("inscount: program exited with code {}, {} thread(s)", code, threads.started());
            env.publish(ToolKind::InsCount, &ProfileReport::Instructions(thread_rows(&threads)));
        }));
    }
}

impl Tool for InsCountExt {
    fn kind(&self) -> ToolKind { ToolKind::InsCountExt }

    fn install(&self, host: &mut dyn InstrumentationHost, env: &ToolEnv) {
        let threads: Threads = Arc::new(ThreadStorage::new());
        install_thread_counting(host, &threads);
        install_block_counting(host, &threads);

        let taken_branch = per_thread(&threads, |s, a| if a.branch_taken { s.record_taken_branch() });
        let predicated_op = per_thread(&threads, |s, _| s.record_predicated_op());
        let mem_read = per_thread(&threads, |s, _| s.record_read());
        let mem_write = per_thread(&threads, |s, _| s.record_write());

        host.instrument_instructions(Box::new(move |ins, probes| {
            if ins.direct_branch_or_call {
                probes.insert_call(taken_branch.clone());
            } else if ins.predicated {
                probes.insert_predicated_call(predicated_op.clone());
            }

            // A read-modify-write operand is probed once for each direction.
            for op in &ins.mem_operands {
                if op.is_read() {
                    probes.insert_predicated_call(mem_read.clone());
                }
                if op.is_written() {
                    probes.insert_predicated_call(mem_write.clone());
                }
            }
        }));

        let env = env.clone();
        host.on_fini(Box::new(move |code| {
            debug!("inscount_ext: program exited with code {}, {} thread(s)", code, threads.started());
            env.publish(ToolKind::InsCountExt, &ProfileReport::Extended(thread_rows(&threads)));
        }));
    }
}

/// Bind a fresh record to every thread as it starts.
fn install_thread_counting(host: &mut dyn InstrumentationHost, threads: &Threads) {
    let threads = threads.clone();
    host.on_thread_start(Box::new(move |tid| {
        if let Err(e) = threads.bind(tid, ThreadStat::new()) {
            warn!("inscount: thread {} will not be counted: {}", tid, e);
        }
    }));
}

/// Add each block's static instruction count every time it executes.
fn install_block_counting(host: &mut dyn InstrumentationHost, threads: &Threads) {
    let threads = threads.clone();
    host.instrument_blocks(Box::new(move |bbl, probes| {
        let n = bbl.num_ins() as u64;
        let threads = threads.clone();
        probes.insert_call(Arc::new(move |args: &ProbeArgs| {
            if let Some(stat) = threads.get(args.thread) {
                stat.add_instructions(n);
            }
        }));
    }));
}

/// Probe applying `f` to the executing thread's record.
fn per_thread(threads: &Threads, f: fn(&ThreadStat, &ProbeArgs)) -> Analysis {
    let threads = threads.clone();
    Arc::new(move |args: &ProbeArgs| {
        if let Some(stat) = threads.get(args.thread) {
            f(stat, args);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemOperand;
    use crate::sim::{Event, Program, SimHost, SimImage, SimInstruction, SimRoutine};
    use crate::sink::{OutputSink, SharedBuffer};

    fn run(tool: &dyn Tool, program: &Program) -> Vec<String> {
        let buf = SharedBuffer::new();
        let env = ToolEnv::new(Arc::new(OutputSink::from_writer(buf.clone())));
        let mut host = SimHost::new(program.pid);
        assert!(tool.try_install(tool.kind().id(), &mut host, &env));
        host.run(program).unwrap();
        assert!(env.sink.is_closed());
        buf.lines()
    }

    fn image(routines: Vec<SimRoutine>) -> SimImage {
        SimImage::new("/opt/app/bin/app", routines)
    }

    #[test]
    fn test_counts_block_instructions_per_thread() {
        // 3 + 2 instructions per call.
        let work = SimRoutine::new("work", 0x1000, vec![
            vec![SimInstruction::plain(); 3],
            vec![SimInstruction::plain(); 2],
        ]);
        let program = Program::new(10)
            .image(image(vec![work]))
            .event(Event::Load("/opt/app/bin/app".into()))
            .event(Event::Start(0))
            .event(Event::Start(1))
            .event(Event::call(0, 0x1000).times(4))
            .event(Event::call(1, 0x1000));
        let lines = run(&InsCount, &program);
        assert_eq!(lines, vec!["Id,Instructions", "0,20", "1,5"]);
    }

    #[test]
    fn test_no_threads_only_header() {
        let program = Program::new(10).image(image(vec![]));
        assert_eq!(run(&InsCount, &program), vec!["Id,Instructions"]);
    }

    #[test]
    fn test_one_row_per_started_thread() {
        let mut program = Program::new(3).image(image(vec![]));
        for t in 0..5 {
            program = program.event(Event::Start(t));
        }
        program = program.event(Event::End { thread: 2, code: 0 });
        let lines = run(&InsCount, &program);
        assert_eq!(lines.len(), 6);
        for (i, line) in lines[1..].iter().enumerate() {
            assert_eq!(line, &format!("{},0", i));
        }
    }

    #[test]
    fn test_extended_memory_accesses() {
        // R=2 read-only, W=3 write-only, M=1 read-modify-write.
        let mut ins = vec![SimInstruction::mem(&[MemOperand::Read, MemOperand::Read])];
        ins.push(SimInstruction::mem(&[MemOperand::Write; 3]));
        ins.push(SimInstruction::mem(&[MemOperand::ReadWrite]));
        let program = Program::new(1)
            .image(image(vec![SimRoutine::new("mem", 0x2000, vec![ins])]))
            .event(Event::Load("/opt/app/bin/app".into()))
            .event(Event::Start(0))
            .event(Event::call(0, 0x2000));
        let lines = run(&InsCountExt, &program);
        assert_eq!(lines[0], "Id,Instructions,Reads,Writes,Branches,FloatPoint");
        assert_eq!(lines[1], "0,3,3,4,0,0");
    }

    #[test]
    fn test_extended_branches_and_predicated() {
        let ins = vec![
            SimInstruction::branch(true),
            SimInstruction::branch(false),
            SimInstruction::predicated(true),
            SimInstruction::predicated(false),
            // Predicate false: its memory access never happens.
            SimInstruction::predicated(false).with_mem(&[MemOperand::Read]),
            // A predicated branch counts as a branch only.
            SimInstruction::branch(true).with_predicate(true),
        ];
        let program = Program::new(1)
            .image(image(vec![SimRoutine::new("ctl", 0x3000, vec![ins])]))
            .event(Event::Load("/opt/app/bin/app".into()))
            .event(Event::Start(0))
            .event(Event::call(0, 0x3000).times(2));
        let lines = run(&InsCountExt, &program);
        assert_eq!(lines[1], "0,12,0,0,4,2");
    }

    #[test]
    fn test_parallel_threads_keep_their_own_counts() {
        let work = SimRoutine::new("spin", 0x4000, vec![vec![SimInstruction::plain(); 4]]);
        let scripts: Vec<Vec<Event>> = (0..6)
            .map(|t| vec![Event::Start(t), Event::call(t, 0x4000).times(500 + t as u64)])
            .collect();
        let program = Program::new(2)
            .image(image(vec![work]))
            .event(Event::Load("/opt/app/bin/app".into()))
            .event(Event::Parallel(scripts));
        let lines = run(&InsCount, &program);
        assert_eq!(lines.len(), 7);
        for t in 0..6u64 {
            assert_eq!(lines[t as usize + 1], format!("{},{}", t, 4 * (500 + t)));
        }
    }
}
