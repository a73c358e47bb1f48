//! Per-routine call and instruction counts, aggregated across all threads.
//!
//! Each discovered routine gets a [`RoutineStat`] with its identity copied
//! out immediately, a probe at entry counting calls and a probe on every
//! instruction counting executions. The counters are shared by every thread
//! and bumped without synchronization; see [`RelaxedCounter`].
//!
//! At exit, routines that executed at least one instruction are printed most
//! recently discovered first.
//!
//! [`RelaxedCounter`]: crate::routines::RelaxedCounter

use std::sync::Arc;

use log::debug;

use crate::host::{Analysis, IPoint, InstrumentationHost, ProbeArgs};
use crate::report::{routine_rows, ProfileReport};
use crate::routines::{RoutineRegistry, RoutineStat};
use crate::tools::{Tool, ToolEnv, ToolKind};

/// Tool 2: calls and executed instructions per routine.
pub struct ProcCount;

impl Tool for ProcCount {
    fn kind(&self) -> ToolKind { ToolKind::ProcCount }

    fn install(&self, host: &mut dyn InstrumentationHost, env: &ToolEnv) {
        let registry = Arc::new(RoutineRegistry::new());

        let reg = registry.clone();
        host.instrument_routines(Box::new(move |rtn, probes| {
            let stat = reg.discover(rtn);
            debug!("proccount: {} in {} at {:#x}, {} instruction(s)",
                stat.name, stat.image, stat.address, rtn.num_ins());

            probes.insert_call(IPoint::Before, bump(&stat, |s| s.calls.bump()));
            let count_ins = bump(&stat, |s| s.instructions.bump());
            for index in 0..rtn.num_ins() {
                probes.insert_ins_call(index, count_ins.clone());
            }
        }));

        let env = env.clone();
        host.on_fini(Box::new(move |code| {
            let records = registry.recent_first();
            debug!("proccount: program exited with code {}, {} routine(s) discovered", code, records.len());
            let rows = routine_rows(records.iter().map(|r| &**r));
            env.publish(ToolKind::ProcCount, &ProfileReport::Routines(rows));
        }));
    }
}

fn bump(stat: &Arc<RoutineStat>, f: fn(&RoutineStat)) -> Analysis {
    let stat = stat.clone();
    Arc::new(move |_: &ProbeArgs| f(&stat))
}
