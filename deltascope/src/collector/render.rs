use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{Context, Result};
use deltascope_common::{DeltaEvent, ProbeKind};
use log::{info, warn};
use serde::Serialize;

use super::AggregateRow;
use crate::engine::{Comm, DropCounts};

/// Log target of rendered reports, enabled at `info` by the binary.
pub const REPORT_TARGET: &str = "deltascope::report";

pub trait Render: Send {
    fn event(&mut self, source: &str, event: &DeltaEvent) -> Result<()>;

    fn aggregates(&mut self, source: &str, rows: &[AggregateRow]) -> Result<()>;

    fn drops(&mut self, source: &str, drops: &DropCounts) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn format_duration(ns: u64) -> String {
    if ns >= 1_000_000_000 {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    } else if ns >= 1_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.2}us", ns as f64 / 1_000.0)
    } else {
        format!("{}ns", ns)
    }
}

fn probe_label(kind: u32) -> String {
    ProbeKind::from_u32(kind)
        .map(|k| k.name().to_uppercase())
        .unwrap_or_else(|| format!("PROBE{}", kind))
}

/// Human-readable report through the `log` facade.
pub struct LogRender {
    top: usize,
}

impl LogRender {
    pub fn new(top: usize) -> Self {
        Self { top: top.max(1) }
    }
}

impl Render for LogRender {
    fn event(&mut self, _source: &str, event: &DeltaEvent) -> Result<()> {
        let comm = Comm::from_bytes(event.comm);
        let label = probe_label(event.kind);
        match ProbeKind::from_u32(event.kind) {
            Some(ProbeKind::KvmPageFault) => info!(
                target: REPORT_TARGET,
                "{} pid={} tid={} comm={} addr={:#x} delta={} retries={}",
                label,
                event.pid,
                event.tid,
                comm,
                event.addr,
                format_duration(event.delta_ns),
                event.extra
            ),
            Some(ProbeKind::MemAlloc) => info!(
                target: REPORT_TARGET,
                "{} pid={} comm={} addr={:#x} bytes={} lifetime={}",
                label,
                event.pid,
                comm,
                event.addr,
                event.extra,
                format_duration(event.delta_ns)
            ),
            Some(ProbeKind::SoftIrq | ProbeKind::HardIrq) => info!(
                target: REPORT_TARGET,
                "{} cpu={} vec={} delta={}",
                label,
                event.cpu,
                event.addr,
                format_duration(event.delta_ns)
            ),
            _ => info!(
                target: REPORT_TARGET,
                "{} pid={} tid={} comm={} cpu={} delta={}",
                label,
                event.pid,
                event.tid,
                comm,
                event.cpu,
                format_duration(event.delta_ns)
            ),
        }
        Ok(())
    }

    fn aggregates(&mut self, source: &str, rows: &[AggregateRow]) -> Result<()> {
        let mut sorted: Vec<&AggregateRow> = rows.iter().collect();
        sorted.sort_by(|a, b| b.stats.cumulative.cmp(&a.stats.cumulative));

        info!(target: REPORT_TARGET, "== {} ({} entries) ==", source, rows.len());
        for row in sorted.iter().take(self.top) {
            let comm = row.comm.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
            let stats = &row.stats;
            match row.expected {
                Some(expected) => info!(
                    target: REPORT_TARGET,
                    "  {} comm={} expected={} accessed={} avg_wait={}",
                    row.identity,
                    comm,
                    expected,
                    stats.count,
                    format_duration(stats.average().unwrap_or(0))
                ),
                None => info!(
                    target: REPORT_TARGET,
                    "  {} comm={} count={} total={} avg={} min={} max={}",
                    row.identity,
                    comm,
                    stats.count,
                    format_duration(stats.cumulative),
                    format_duration(stats.average().unwrap_or(0)),
                    format_duration(stats.min),
                    format_duration(stats.max)
                ),
            }
        }
        Ok(())
    }

    fn drops(&mut self, source: &str, drops: &DropCounts) -> Result<()> {
        let detail: Vec<String> = drops
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(kind, n)| format!("{}={}", kind.name(), n))
            .collect();
        warn!("{} lost {} samples: {}", source, drops.total(), detail.join(" "));
        Ok(())
    }
}

#[derive(Serialize)]
struct EventRecord {
    probe: String,
    pid: u32,
    tid: u32,
    cpu: u32,
    comm: Comm,
    start_ns: u64,
    end_ns: u64,
    delta_ns: u64,
    addr: u64,
    extra: u64,
}

impl From<&DeltaEvent> for EventRecord {
    fn from(event: &DeltaEvent) -> Self {
        Self {
            probe: ProbeKind::from_u32(event.kind)
                .map(|k| k.name().to_string())
                .unwrap_or_else(|| event.kind.to_string()),
            pid: event.pid,
            tid: event.tid,
            cpu: event.cpu,
            comm: Comm::from_bytes(event.comm),
            start_ns: event.start_ns,
            end_ns: event.end_ns,
            delta_ns: event.delta_ns,
            addr: event.addr,
            extra: event.extra,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Event {
        source: &'a str,
        #[serde(flatten)]
        event: EventRecord,
    },
    Aggregate {
        source: &'a str,
        #[serde(flatten)]
        row: &'a AggregateRow,
    },
    Drops {
        source: &'a str,
        total: u64,
        counts: BTreeMap<&'static str, u64>,
    },
}

/// One JSON object per line.
pub struct JsonRender<W: Write + Send> {
    out: W,
}

impl JsonRender<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonRender<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, record: &Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, record).context("Failed to encode record")?;
        self.out.write_all(b"\n").context("Failed to write record")?;
        Ok(())
    }
}

impl<W: Write + Send> Render for JsonRender<W> {
    fn event(&mut self, source: &str, event: &DeltaEvent) -> Result<()> {
        self.write(&Record::Event {
            source,
            event: EventRecord::from(event),
        })
    }

    fn aggregates(&mut self, source: &str, rows: &[AggregateRow]) -> Result<()> {
        for row in rows {
            self.write(&Record::Aggregate { source, row })?;
        }
        Ok(())
    }

    fn drops(&mut self, source: &str, drops: &DropCounts) -> Result<()> {
        self.write(&Record::Drops {
            source,
            total: drops.total(),
            counts: drops.iter().map(|(kind, n)| (kind.name(), n)).collect(),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AggregateStats, Identity};
    use deltascope_common::DropKind;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(999), "999ns");
        assert_eq!(format_duration(1_500), "1.50us");
        assert_eq!(format_duration(2_000_000), "2.00ms");
        assert_eq!(format_duration(3_250_000_000), "3.25s");
    }

    #[test]
    fn test_json_event_line() {
        let mut render = JsonRender::new(Vec::new());
        let event = DeltaEvent {
            kind: ProbeKind::SchedDelay as u32,
            pid: 42,
            tid: 43,
            cpu: 1,
            start_ns: 100,
            end_ns: 250,
            delta_ns: 150,
            comm: *Comm::new("worker").as_bytes(),
            ..Default::default()
        };
        render.event("sched_delay", &event).unwrap();

        let out = String::from_utf8(render.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["probe"], "sched_delay");
        assert_eq!(value["pid"], 42);
        assert_eq!(value["delta_ns"], 150);
        assert_eq!(value["comm"], "worker");
    }

    #[test]
    fn test_json_aggregate_lines() {
        let mut render = JsonRender::new(Vec::new());
        let rows = vec![
            AggregateRow {
                probe: "softirq",
                identity: Identity::ByAddress { addr: 3 },
                comm: None,
                stats: AggregateStats {
                    count: 2,
                    cumulative: 30,
                    min: 10,
                    max: 20,
                },
                expected: None,
            },
            AggregateRow {
                probe: "readahead",
                identity: Identity::BySubject { pid: 9 },
                comm: Some(Comm::new("cat")),
                stats: AggregateStats::default(),
                expected: Some(4),
            },
        ];
        render.aggregates("softirq", &rows).unwrap();

        let out = String::from_utf8(render.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "aggregate");
        assert_eq!(lines[0]["identity"]["by"], "by_address");
        assert_eq!(lines[0]["identity"]["addr"], 3);
        assert_eq!(lines[0]["cumulative"], 30);
        assert!(lines[0].get("expected").is_none());
        assert_eq!(lines[1]["comm"], "cat");
        assert_eq!(lines[1]["expected"], 4);
    }

    #[test]
    fn test_json_drops_line() {
        let mut render = JsonRender::new(Vec::new());
        let mut drops = DropCounts::default();
        drops.add(DropKind::CorrelationMiss, 2);
        render.drops("offcpu", &drops).unwrap();

        let out = String::from_utf8(render.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["type"], "drops");
        assert_eq!(value["total"], 2);
        assert_eq!(value["counts"]["correlation_miss"], 2);
        assert_eq!(value["counts"]["stream_dropped"], 0);
    }

    #[test]
    fn test_log_render_accepts_everything() {
        let mut render = LogRender::new(5);
        render.event("x", &DeltaEvent::default()).unwrap();
        render.aggregates("x", &[]).unwrap();
        render.drops("x", &DropCounts::default()).unwrap();
    }
}
