//! Per-rank progress keys and the desync report built from them.
//!
//! With desync debugging on, every rank publishes the last collective it
//! started and the last one it completed. On a timeout the report compares
//! all ranks' keys to tell a hung peer from ranks that diverged.

use crate::error::Result;
use crate::store::Store;
use crate::types::{OpKind, Rank};
use std::collections::BTreeMap;
use std::fmt::Write;

pub fn trace_start_key(backend: &str, rank: Rank) -> String {
    format!("{backend}_{rank}_trace_start")
}

pub fn trace_end_key(backend: &str, rank: Rank) -> String {
    format!("{backend}_{rank}_trace_end")
}

/// Encode a trace value as `seq:OP`.
pub fn encode_trace(seq: u64, kind: OpKind) -> Vec<u8> {
    format!("{seq}:{}", kind.as_str()).into_bytes()
}

pub fn parse_trace(value: &[u8]) -> Option<(u64, OpKind)> {
    let text = std::str::from_utf8(value).ok()?;
    let (seq, kind) = text.split_once(':')?;
    Some((
        seq.parse().ok()?,
        OpKind::from_name(kind).unwrap_or(OpKind::Unknown),
    ))
}

/// Publish this rank's progress under `key`.
pub async fn update_trace(store: &dyn Store, key: &str, seq: u64, kind: OpKind) -> Result<()> {
    store.set(key, encode_trace(seq, kind)).await
}

async fn read_trace(store: &dyn Store, key: String) -> Result<Option<(u64, OpKind)>> {
    if !store.check(std::slice::from_ref(&key)).await? {
        return Ok(None);
    }
    Ok(parse_trace(&store.get(&key).await?))
}

fn join(ranks: &[Rank]) -> String {
    ranks
        .iter()
        .map(Rank::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compare every rank's trace keys with this rank's and describe the mismatch.
pub async fn desync_report(
    store: &dyn Store,
    backend: &str,
    rank: Rank,
    world_size: u32,
) -> Result<String> {
    let Some((seq, kind)) = read_trace(store, trace_start_key(backend, rank)).await? else {
        return Ok(format!(
            "[Rank {rank}] no collective has been started on this rank, nothing to compare"
        ));
    };

    let mut never_started = Vec::new();
    let mut behind: BTreeMap<u64, Vec<Rank>> = BTreeMap::new();
    let mut ahead: BTreeMap<u64, Vec<Rank>> = BTreeMap::new();
    let mut diverged = Vec::new();
    let mut unfinished = Vec::new();

    for peer in 0..world_size {
        match read_trace(store, trace_start_key(backend, peer)).await? {
            None => never_started.push(peer),
            Some((s, _)) if s < seq => behind.entry(s).or_default().push(peer),
            Some((s, _)) if s > seq => ahead.entry(s).or_default().push(peer),
            Some((_, k)) if k != kind => diverged.push((peer, k)),
            Some(_) => {
                let finished = read_trace(store, trace_end_key(backend, peer))
                    .await?
                    .is_some_and(|(s, _)| s >= seq);
                if !finished {
                    unfinished.push(peer);
                }
            }
        }
    }

    let mut report = format!("[Rank {rank}] running collective #{seq} ({kind})");
    let mut found = false;
    if !never_started.is_empty() {
        found = true;
        let _ = write!(
            report,
            "; ranks [{}] have not started any collective",
            join(&never_started)
        );
    }
    for (s, ranks) in &behind {
        found = true;
        let _ = write!(report, "; ranks [{}] are behind at collective #{s}", join(ranks));
    }
    for (s, ranks) in &ahead {
        found = true;
        let _ = write!(report, "; ranks [{}] are ahead at collective #{s}", join(ranks));
    }
    for (peer, k) in &diverged {
        found = true;
        let _ = write!(report, "; rank {peer} is running {k} for the same collective");
    }
    if !found {
        if unfinished.is_empty() {
            report.push_str("; all ranks completed it, no desync found");
        } else {
            let _ = write!(
                report,
                "; all ranks joined it but it has not finished on ranks [{}]",
                join(&unfinished)
            );
        }
    }
    Ok(report)
}
