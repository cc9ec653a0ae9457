//! Node rows from `scontrol --oneliner show nodes`.

use crate::parse::{parse_key_value_records, parse_u32, KeyValueRecord, ParseReport};
use crate::tres::{is_absent, parse_gres_gpus, parse_tres_gpus};
use crate::{GpuBreakdown, NodeInfo};
use std::collections::BTreeMap;
use tracing::warn;

const KNOWN_KEYS: &[&str] = &[
    "NodeName",
    "State",
    "Reason",
    "Partitions",
    "CPUTot",
    "CPUAlloc",
    "RealMemory",
    "AllocMem",
    "Gres",
    "CfgTRES",
    "AllocTRES",
];

pub fn parse_nodes(raw: &str) -> ParseReport<NodeInfo> {
    let mut report = ParseReport::default();
    for record in parse_key_value_records(raw) {
        match node_from_record(&record) {
            Some(node) => report.records.push(node),
            None => {
                warn!("node_record_skipped: no NodeName in {:?}", record.pairs());
                report.skipped += 1;
            }
        }
    }
    report
}

pub fn node_from_record(record: &KeyValueRecord) -> Option<NodeInfo> {
    let name = record.field("NodeName").trim();
    if name.is_empty() {
        return None;
    }
    let context = format!("node {name}");
    let state = record.field("State").to_string();

    let gpus_total = configured_gpus(record);
    let gpus_alloc = allocated_gpus(record, &state, &gpus_total);

    let extra: BTreeMap<String, String> = record
        .pairs()
        .iter()
        .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();

    Some(NodeInfo {
        name: name.to_string(),
        reason: clean(record.field("Reason")),
        partitions: clean(record.field("Partitions")),
        cpus_total: parse_u32("CPUTot", record.field("CPUTot"), &context),
        cpus_alloc: parse_u32("CPUAlloc", record.field("CPUAlloc"), &context),
        memory_total_gb: megabytes_to_gb(parse_u32(
            "RealMemory",
            record.field("RealMemory"),
            &context,
        )),
        memory_alloc_gb: megabytes_to_gb(parse_u32(
            "AllocMem",
            record.field("AllocMem"),
            &context,
        )),
        state,
        gpus_total,
        gpus_alloc,
        extra,
    })
}

// CfgTRES carries typed counts on recent Slurm; Gres is the older spelling.
fn configured_gpus(record: &KeyValueRecord) -> GpuBreakdown {
    let from_tres = parse_tres_gpus(record.field("CfgTRES"));
    if !from_tres.is_empty() {
        return from_tres;
    }
    parse_gres_gpus(record.field("Gres"))
}

fn allocated_gpus(record: &KeyValueRecord, state: &str, total: &GpuBreakdown) -> GpuBreakdown {
    let alloc_tres = record.field("AllocTRES");
    if !is_absent(alloc_tres) {
        let from_tres = parse_tres_gpus(alloc_tres);
        // AllocTRES may only carry the generic count; attribute it to the
        // node's single configured type when there is one.
        if let (Some(generic), 1) = (from_tres.0.get("gpu"), total.0.len()) {
            if from_tres.0.len() == 1 {
                let mut typed = GpuBreakdown::new();
                if let Some(gpu_type) = total.0.keys().next() {
                    typed.add(gpu_type, *generic);
                }
                return typed;
            }
        }
        return from_tres;
    }
    let upper = state.to_ascii_uppercase();
    if upper.contains("ALLOCATED") && !upper.contains("MIXED") {
        return total.clone();
    }
    GpuBreakdown::new()
}

fn megabytes_to_gb(megabytes: u32) -> f64 {
    f64::from(megabytes) / 1024.0
}

fn clean(value: &str) -> String {
    if is_absent(value) {
        String::new()
    } else {
        value.trim().to_string()
    }
}
