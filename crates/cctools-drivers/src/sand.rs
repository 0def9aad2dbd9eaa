//! Two-phase assembly pipeline (`sand_filter_master.c` / `sand_align_master.c`).
//! Phase 1 reuses the matrix-tiling driver ([`crate::allpairs`]) to emit a
//! candidate-pairs file. Phase 2 groups candidates by their "A" sequence so
//! one task carries one A against many B sequences (amortizing transfer),
//! reading compressed sequence bytes from an in-memory table populated from
//! the sequence list so workers need no shared filesystem.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use cctools_core::codec::CompressedSequence;
use cctools_queue::{CachePolicy, Queue, Task, TaskId, TaskResultKind};

use crate::skeleton::{ProgressCounters, ProgressTable};

pub struct SandAlignConfig {
    /// `A B` candidate pair lines produced by the filter phase.
    pub candidate_pairs_path: PathBuf,
    /// Sequence list file in the `compressed_sequence` wire format.
    pub sequence_list_path: PathBuf,
    pub align_binary: PathBuf,
    pub overlap_output_path: PathBuf,
    /// Maximum number of B sequences grouped into one alignment task.
    pub max_group_size: usize,
}

/// Parse `A B` candidate-pair lines.
pub fn load_candidate_pairs(path: &std::path::Path) -> anyhow::Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(a, b)| (a.to_string(), b.trim().to_string()))
        .collect())
}

/// Read every record out of a sequence-list file into a name-keyed table.
/// Populated once per align run rather than at filter time, so the filter
/// phase never needs to know the compressed representation.
pub fn load_sequences(path: &std::path::Path) -> anyhow::Result<HashMap<String, CompressedSequence>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut out = HashMap::new();
    while let Some(record) = CompressedSequence::read(&mut reader)? {
        out.insert(record.name.clone(), record);
    }
    Ok(out)
}

/// Group `(A, B)` pairs by `A`, each group capped at `max_group_size` B
/// names so a single task stays bounded.
pub fn group_candidates(
    pairs: &[(String, String)],
    max_group_size: usize,
) -> Vec<(String, Vec<String>)> {
    let mut by_a: HashMap<&str, Vec<String>> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for (a, b) in pairs {
        if !by_a.contains_key(a.as_str()) {
            order.push(a.as_str());
        }
        by_a.entry(a.as_str()).or_default().push(b.clone());
    }

    let mut groups = Vec::new();
    for a in order {
        let bs = &by_a[a];
        for chunk in bs.chunks(max_group_size.max(1)) {
            groups.push((a.to_string(), chunk.to_vec()));
        }
    }
    groups
}

/// Serialize one A sequence followed by its B sequences and the
/// end-of-list sentinel, in `compressed_sequence` wire format.
fn serialize_group(a: &CompressedSequence, bs: &[&CompressedSequence]) -> Vec<u8> {
    let mut buf = Vec::new();
    CompressedSequence::write(Some(a), Some("A"), &mut buf);
    for b in bs {
        CompressedSequence::write(Some(b), Some("B"), &mut buf);
    }
    CompressedSequence::write(None, None, &mut buf);
    buf
}

fn task_for_group(
    config: &SandAlignConfig,
    a: &CompressedSequence,
    bs: &[&CompressedSequence],
) -> Task {
    let mut task = Task::new("./align_bin seqs.dat").with_tag(a.name.clone());
    task.specify_input_file(&config.align_binary, "align_bin", CachePolicy::Cache);
    task.specify_input_buffer(serialize_group(a, bs), "seqs.dat".to_string(), CachePolicy::NoCache);
    task
}

/// Run the align phase to completion, appending every task's overlap
/// records to `overlap_output_path`.
pub async fn run(queue: &Queue, config: &SandAlignConfig) -> anyhow::Result<()> {
    let pairs = load_candidate_pairs(&config.candidate_pairs_path)?;
    let sequences = load_sequences(&config.sequence_list_path)?;
    let groups = group_candidates(&pairs, config.max_group_size);

    let mut output = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.overlap_output_path)?;

    let mut pending: Vec<(String, Vec<String>)> = groups;
    pending.reverse();

    let mut in_flight: HashMap<TaskId, String> = HashMap::new();
    let mut counters = ProgressCounters::default();
    let mut progress = ProgressTable::new(Duration::from_secs(5));

    while !pending.is_empty() || !in_flight.is_empty() {
        while !pending.is_empty() && queue.hungry().await {
            let (a_name, b_names) = pending.pop().expect("checked non-empty");
            let Some(a_seq) = sequences.get(&a_name) else {
                continue; // referenced sequence absent from the list; skip silently
            };
            let b_seqs: Vec<&CompressedSequence> = b_names
                .iter()
                .filter_map(|name| sequences.get(name))
                .collect();
            let task = task_for_group(config, a_seq, &b_seqs);
            let id = queue.submit(task).await?;
            in_flight.insert(id, a_name);
            counters.submitted += 1;
        }

        if let Some(task) = queue.wait(Duration::from_secs(1)).await {
            if in_flight.remove(&task.id()).is_some() {
                if matches!(task.result(), Some(TaskResultKind::Success)) {
                    output.write_all(task.output())?;
                    output.flush()?;
                    counters.candidates_or_cells += 1;
                }
                counters.done += 1;
            }
        }

        let stats = queue.stats().await;
        counters.update_from_stats(&stats);
        if progress.due() {
            progress.print(&counters, &stats);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_candidates_caps_chunk_size_and_preserves_a_order() {
        let pairs = vec![
            ("a1".to_string(), "b1".to_string()),
            ("a1".to_string(), "b2".to_string()),
            ("a1".to_string(), "b3".to_string()),
            ("a2".to_string(), "b4".to_string()),
        ];
        let groups = group_candidates(&pairs, 2);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], ("a1".to_string(), vec!["b1".to_string(), "b2".to_string()]));
        assert_eq!(groups[1], ("a1".to_string(), vec!["b3".to_string()]));
        assert_eq!(groups[2], ("a2".to_string(), vec!["b4".to_string()]));
    }

    #[test]
    fn serialize_group_round_trips_through_compressed_sequence_read() {
        let a = CompressedSequence::from_bases("a1", "ACGT", "");
        let b = CompressedSequence::from_bases("b1", "TTTT", "");
        let bytes = serialize_group(&a, &[&b]);

        let mut cursor = std::io::Cursor::new(bytes);
        let first = CompressedSequence::read(&mut cursor).unwrap().unwrap();
        assert_eq!(first.name, "a1");
        let second = CompressedSequence::read(&mut cursor).unwrap().unwrap();
        assert_eq!(second.name, "b1");
        assert!(CompressedSequence::read(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn load_candidate_pairs_parses_whitespace_separated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.txt");
        std::fs::write(&path, "seq1 seq2\nseq1 seq3\n").unwrap();
        let pairs = load_candidate_pairs(&path).unwrap();
        assert_eq!(pairs, vec![
            ("seq1".to_string(), "seq2".to_string()),
            ("seq1".to_string(), "seq3".to_string()),
        ]);
    }
}
