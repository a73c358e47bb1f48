//! Live event log of thread lifecycle and `malloc` calls.
//!
//! Unlike the counting tools nothing is aggregated: every event is written
//! and flushed to the output as it happens, one line per lock acquisition,
//! so the log is usable even if the program dies before exit.
//!
//! ```text
//! thread begin 0
//! thread 0 entered malloc(32)
//! thread 0 after malloc ret(94746512)
//! thread 0 end code(0)
//! ```

use std::sync::Arc;

use log::debug;

use crate::host::{IPoint, InstrumentationHost, ProbeArgs};
use crate::tools::{Tool, ToolEnv, ToolKind};

/// Symbol wrapped in every loaded image.
pub const ALLOC_ROUTINE: &str = "malloc";

/// Tool 3: thread and allocation event log.
pub struct MallocTrace;

impl Tool for MallocTrace {
    fn kind(&self) -> ToolKind { ToolKind::MallocTrace }

    fn install(&self, host: &mut dyn InstrumentationHost, env: &ToolEnv) {
        let sink = env.sink.clone();
        host.instrument_images(Box::new(move |img, probes| {
            // Most images do not define the allocator.
            let Some(rtn) = img.find_routine(ALLOC_ROUTINE) else { return };
            debug!("malloctrace: wrapping {} at {:#x} in {}", rtn.name, rtn.address, img.name);

            let probes = probes.routine(rtn);
            let s = sink.clone();
            probes.insert_call(IPoint::Before, Arc::new(move |a: &ProbeArgs| {
                s.write_line(format_args!("thread {} entered {}({})", a.thread, ALLOC_ROUTINE, a.arg0));
            }));
            let s = sink.clone();
            probes.insert_call(IPoint::After, Arc::new(move |a: &ProbeArgs| {
                s.write_line(format_args!("thread {} after {} ret({})", a.thread, ALLOC_ROUTINE, a.ret));
            }));
        }));

        let sink = env.sink.clone();
        host.on_thread_start(Box::new(move |tid| {
            sink.write_line(format_args!("thread begin {}", tid));
        }));

        let sink = env.sink.clone();
        host.on_thread_fini(Box::new(move |tid, code| {
            sink.write_line(format_args!("thread {} end code({})", tid, code));
        }));

        let sink = env.sink.clone();
        host.on_fini(Box::new(move |code| {
            debug!("malloctrace: program exited with code {}", code);
            sink.close();
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::sim::{Event, Program, SimHost, SimImage, SimInstruction, SimRoutine};
    use crate::sink::{OutputSink, SharedBuffer};

    const APP: &str = "/opt/app/bin/app";
    const LIBC: &str = "/usr/lib/libc.so.6";
    const MALLOC: u64 = 0x7f10_0000;

    fn program() -> Program {
        Program::new(77)
            .image(SimImage::new(APP, vec![
                SimRoutine::new("main", 0x401000, vec![vec![SimInstruction::plain()]]),
            ]))
            .image(SimImage::new(LIBC, vec![
                SimRoutine::new("free", 0x7f10_1000, vec![vec![SimInstruction::plain()]]),
                SimRoutine::new("malloc", MALLOC, vec![vec![SimInstruction::plain(); 6]]),
            ]))
            .event(Event::Load(APP.into()))
            .event(Event::Load(LIBC.into()))
    }

    fn run(program: &Program) -> (Vec<String>, Arc<OutputSink>) {
        let buf = SharedBuffer::new();
        let env = ToolEnv::new(Arc::new(OutputSink::from_writer(buf.clone())));
        let mut host = SimHost::new(program.pid);
        MallocTrace.install(&mut host, &env);
        host.run(program).unwrap();
        (buf.lines(), env.sink)
    }

    #[test]
    fn test_single_thread_log() {
        let program = program()
            .event(Event::Start(0))
            .event(Event::call(0, 0x401000))
            .event(Event::call(0, MALLOC).arg(32).ret(0x1000))
            .event(Event::call(0, 0x7f10_1000))
            .event(Event::End { thread: 0, code: 3 });
        let (lines, sink) = run(&program);
        assert_eq!(lines, vec![
            "thread begin 0",
            "thread 0 entered malloc(32)",
            "thread 0 after malloc ret(4096)",
            "thread 0 end code(3)",
        ]);
        assert!(sink.is_closed());
        assert!(sink.is_healthy());
    }

    #[test]
    fn test_live_threads_end_with_exit_code() {
        let mut program = program().event(Event::Start(0)).event(Event::Start(1));
        program.exit_code = 9;
        let (lines, _) = run(&program);
        assert_eq!(lines[2..], ["thread 0 end code(9)", "thread 1 end code(9)"]);
    }

    #[test]
    fn test_images_without_malloc_are_skipped() {
        let program = Program::new(1)
            .image(SimImage::new(APP, vec![
                SimRoutine::new("main", 0x401000, vec![vec![SimInstruction::plain()]]),
            ]))
            .event(Event::Load(APP.into()))
            .event(Event::Start(0))
            .event(Event::call(0, 0x401000).times(10));
        let (lines, _) = run(&program);
        assert_eq!(lines, vec!["thread begin 0", "thread 0 end code(0)"]);
    }

    #[test]
    fn test_log_reaches_file_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out_77");
        let env = ToolEnv::new(Arc::new(OutputSink::create(&path).unwrap()));
        let mut host = SimHost::new(77);
        MallocTrace.install(&mut host, &env);

        // Inspect the file from inside the program, before any fini runs.
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (p, s) = (path.clone(), seen.clone());
        host.instrument_images(Box::new(move |img, probes| {
            let Some(rtn) = img.find_routine("free") else { return };
            let (p, s) = (p.clone(), s.clone());
            probes.routine(rtn).insert_call(IPoint::Before, Arc::new(move |_: &ProbeArgs| {
                s.lock().push(std::fs::read_to_string(&p).unwrap());
            }));
        }));

        let program = program()
            .event(Event::Start(0))
            .event(Event::call(0, 0x7f10_1000))
            .event(Event::call(0, MALLOC).arg(8).ret(64))
            .event(Event::call(0, 0x7f10_1000));
        host.run(&program).unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0], "thread begin 0\n");
        assert_eq!(seen[1], "thread begin 0\nthread 0 entered malloc(8)\nthread 0 after malloc ret(64)\n");
        assert!(env.sink.is_closed());
    }

    #[test]
    fn test_interleaved_threads_keep_entry_before_exit() {
        const CALLS: u64 = 50;
        let scripts: Vec<Vec<Event>> = (0..4u32)
            .map(|t| {
                let mut s = vec![Event::Start(t)];
                for i in 0..CALLS {
                    s.push(Event::call(t, MALLOC).arg(16 + i).ret(0x10_0000 * (t as u64 + 1) + i));
                }
                s.push(Event::End { thread: t, code: 0 });
                s
            })
            .collect();
        let program = program().event(Event::Parallel(scripts));
        let (lines, _) = run(&program);

        // Per thread: begin, then strictly alternating entered/after, then end.
        let mut per_thread: HashMap<String, Vec<&str>> = HashMap::new();
        for line in &lines {
            let tid = if let Some(rest) = line.strip_prefix("thread begin ") {
                rest.to_string()
            } else {
                line.split_whitespace().nth(1).unwrap().to_string()
            };
            per_thread.entry(tid).or_default().push(line.as_str());
        }
        assert_eq!(per_thread.len(), 4);
        for (tid, events) in per_thread {
            assert_eq!(events.len() as u64, 2 + 2 * CALLS);
            assert_eq!(events[0], format!("thread begin {}", tid));
            for pair in events[1..events.len() - 1].chunks(2) {
                assert!(pair[0].starts_with(&format!("thread {} entered malloc(", tid)));
                assert!(pair[1].starts_with(&format!("thread {} after malloc ret(", tid)));
            }
            assert_eq!(*events.last().unwrap(), format!("thread {} end code(0)", tid));
        }
    }
}
