//! Offline consistency check of a harq store.
//!
//! Walks every declared queue and, for durable ones, verifies that the range
//! index is well formed and that every index it covers has a stored message
//! that decodes.

use serde::Serialize;

use crate::broker::index;
use crate::persistence::{DeclarationType, Store};
use crate::utils::{Error, Result};

#[derive(Debug, Serialize)]
pub struct QueueReport {
    pub name: String,
    pub kind: String,
    /// Messages according to the index; 0 for non-durable queues.
    pub size: u64,
    pub ranges: Vec<(u64, u64)>,
    /// Covered indices with no stored message.
    pub missing: Vec<u64>,
    /// Covered indices whose stored message does not decode.
    pub undecodable: Vec<u64>,
    pub problems: Vec<String>,
}

impl QueueReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.undecodable.is_empty() && self.problems.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct FsckReport {
    pub queues: Vec<QueueReport>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.queues.iter().all(QueueReport::is_clean)
    }

    pub fn total_messages(&self) -> u64 {
        self.queues.iter().map(|q| q.size).sum()
    }
}

/// Check every queue declared in `store`. A declaration list that cannot be
/// read at all is an error; anything wrong inside a queue is reported.
pub fn check(store: &Store) -> Result<FsckReport> {
    let mut queues = Vec::new();
    for decl in store.read_declarations()? {
        let mut report = QueueReport {
            name: decl.name.clone(),
            kind: String::new(),
            size: 0,
            ranges: Vec::new(),
            missing: Vec::new(),
            undecodable: Vec::new(),
            problems: Vec::new(),
        };

        match DeclarationType::try_from(decl.r#type) {
            Ok(DeclarationType::Durable) => {
                report.kind = "durable".into();
                check_durable(store, &mut report);
            }
            Ok(DeclarationType::Transient) => report.kind = "transient".into(),
            Ok(DeclarationType::Broadcast) => report.kind = "broadcast".into(),
            Err(_) => {
                report.kind = "unknown".into();
                report.problems.push(format!("unknown queue type {}", decl.r#type));
            }
        }
        queues.push(report);
    }
    Ok(FsckReport { queues })
}

fn check_durable(store: &Store, report: &mut QueueReport) {
    let qi = match store.read_queue(&report.name) {
        Ok(Some(qi)) => qi,
        Ok(None) => {
            report.problems.push("index record is missing".into());
            return;
        }
        Err(e) => {
            report.problems.push(e.to_string());
            return;
        }
    };

    report.size = qi.size;
    report.ranges = qi.ranges.iter().map(|r| (r.start, r.count)).collect();
    if !index::is_consistent(&qi) {
        report
            .problems
            .push("ranges overlap, are empty or disagree with size".into());
    }

    for idx in index::indices(&qi) {
        match store.read_message(&Store::message_key(&report.name, idx)) {
            Ok(Some(_)) => {}
            Ok(None) => report.missing.push(idx),
            Err(Error::Corrupt { .. }) => report.undecodable.push(idx),
            Err(e) => report.problems.push(format!("reading index {idx}: {e}")),
        }
    }
}
