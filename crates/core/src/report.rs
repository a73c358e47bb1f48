//! Aggregate reports and their text formats.
//!
//! | Report                    | Format |
//! |---------------------------|--------|
//! | [`ProfileReport::Instructions`] | CSV `Id,Instructions` |
//! | [`ProfileReport::Extended`]     | CSV `Id,Instructions,Reads,Writes,Branches,FloatPoint` |
//! | [`ProfileReport::Routines`]     | Fixed-width table, widths 23/15/18/12/12 |
//!
//! Reports are plain data so they can also be archived (see [`crate::archive`])
//! and rendered again later.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::routines::RoutineStat;
use crate::threads::{ThreadCounts, ThreadStat, ThreadStorage};
use crate::tools::ToolKind;

/// One CSV row: thread index and its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: u32,
    pub counts: ThreadCounts,
}

/// One routine table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineRow {
    pub name: String,
    pub image: String,
    pub address: u64,
    pub calls: u64,
    pub instructions: u64,
}

/// Final output of a counting tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileReport {
    Instructions(Vec<ThreadRow>),
    Extended(Vec<ThreadRow>),
    Routines(Vec<RoutineRow>),
}

/// Rows for every started thread, ascending thread index.
pub fn thread_rows(threads: &ThreadStorage<ThreadStat>) -> Vec<ThreadRow> {
    threads.iter()
        .map(|(tid, stat)| ThreadRow { id: tid.0, counts: stat.snapshot() })
        .collect()
}

/// Rows for routines that executed at least one instruction, in input order.
pub fn routine_rows<'a, I>(records: I) -> Vec<RoutineRow>
where
    I: IntoIterator<Item = &'a RoutineStat>,
{
    records.into_iter()
        .filter(|r| r.instructions.get() > 0)
        .map(|r| RoutineRow {
            name: r.name.clone(),
            image: r.image.clone(),
            address: r.address,
            calls: r.calls.get(),
            instructions: r.instructions.get(),
        })
        .collect()
}

impl ProfileReport {
    /// Tool that produces this kind of report.
    pub fn tool(&self) -> ToolKind {
        match self {
            ProfileReport::Instructions(_) => ToolKind::InsCount,
            ProfileReport::Extended(_) => ToolKind::InsCountExt,
            ProfileReport::Routines(_) => ToolKind::ProcCount,
        }
    }

    /// Write the report in its text format.
    pub fn render(&self, w: &mut dyn Write) -> io::Result<()> {
        match self {
            ProfileReport::Instructions(rows) => {
                writeln!(w, "Id,Instructions")?;
                for r in rows {
                    writeln!(w, "{},{}", r.id, r.counts.instructions)?;
                }
            }
            ProfileReport::Extended(rows) => {
                writeln!(w, "Id,Instructions,Reads,Writes,Branches,FloatPoint")?;
                for r in rows {
                    let c = &r.counts;
                    writeln!(w, "{},{},{},{},{},{}", r.id, c.instructions, c.reads,
                        c.writes, c.taken_branches, c.predicated_ops)?;
                }
            }
            ProfileReport::Routines(rows) => {
                writeln!(w, "{:>23} {:>15} {:>18} {:>12} {:>12}",
                    "Procedure", "Image", "Address", "Calls", "Instructions")?;
                for r in rows {
                    writeln!(w, "{:>23} {:>15} {:>18x} {:>12} {:>12}",
                        r.name, r.image, r.address, r.calls, r.instructions)?;
                }
            }
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.render(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Routine, ThreadId};
    use crate::routines::RoutineRegistry;

    #[test]
    fn test_basic_csv() {
        let threads = ThreadStorage::with_capacity(4);
        threads.bind(ThreadId(0), ThreadStat::new()).unwrap().add_instructions(10);
        threads.bind(ThreadId(1), ThreadStat::new()).unwrap().add_instructions(3);
        let report = ProfileReport::Instructions(thread_rows(&threads));
        assert_eq!(report.to_text(), "Id,Instructions\n0,10\n1,3\n");
    }

    #[test]
    fn test_empty_run_has_only_header() {
        let threads = ThreadStorage::<ThreadStat>::with_capacity(4);
        let report = ProfileReport::Extended(thread_rows(&threads));
        assert_eq!(report.to_text(), "Id,Instructions,Reads,Writes,Branches,FloatPoint\n");
    }

    #[test]
    fn test_extended_csv() {
        let threads = ThreadStorage::with_capacity(1);
        let s = threads.bind(ThreadId(0), ThreadStat::new()).unwrap();
        s.add_instructions(5);
        s.record_read();
        s.record_write();
        s.record_write();
        s.record_taken_branch();
        let report = ProfileReport::Extended(thread_rows(&threads));
        assert_eq!(report.to_text().lines().nth(1), Some("0,5,1,2,1,0"));
    }

    #[test]
    fn test_report_names_its_tool() {
        assert_eq!(ProfileReport::Instructions(vec![]).tool(), ToolKind::InsCount);
        assert_eq!(ProfileReport::Extended(vec![]).tool(), ToolKind::InsCountExt);
        assert_eq!(ProfileReport::Routines(vec![]).tool(), ToolKind::ProcCount);
    }

    #[test]
    fn test_routine_table_layout() {
        let reg = RoutineRegistry::new();
        let rtn = Routine { name: "main".into(), address: 0x401a2b, image: "/tmp/app".into(), blocks: vec![] };
        let stat = reg.discover(&rtn);
        stat.calls.bump();
        for _ in 0..4 { stat.instructions.bump(); }
        let dead = Routine { name: "unused".into(), address: 0x500000, ..rtn.clone() };
        reg.discover(&dead).calls.bump();

        let records = reg.recent_first();
        let report = ProfileReport::Routines(routine_rows(records.iter().map(|r| &**r)));
        let text = report.to_text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{:>23} {:>15} {:>18} {:>12} {:>12}",
            "Procedure", "Image", "Address", "Calls", "Instructions"));
        assert_eq!(lines[1], format!("{:>23} {:>15} {:>18} {:>12} {:>12}",
            "main", "app", "401a2b", 1, 4));
        assert_eq!(lines[1].len(), 23 + 15 + 18 + 12 + 12 + 4);
    }
}
