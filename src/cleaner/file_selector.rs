use std::collections::BTreeSet;

use super::utilization::FileSummary;

/// Thresholds and exclusions for one selection pass.
#[derive(Debug, Clone)]
pub struct SelectionParams {
    /// Clean while overall utilization is below this percentage
    pub min_utilization: u32,
    /// Always clean a file below this percentage
    pub min_file_utilization: u32,
    pub max_files: usize,
    /// Files at or above this number are never selected
    pub upper_bound: u32,
}

/// Picks the files worth cleaning, lowest utilization first. `skip` holds
/// files already being cleaned or waiting for deletion.
pub fn select_files(summaries: &[(u32, FileSummary)], skip: &BTreeSet<u32>, params: &SelectionParams) -> Vec<u32> {
    let mut total_size: u64 = summaries.iter().map(|(_, s)| s.total_size).sum();
    let mut live_size: u64 = summaries.iter().map(|(_, s)| s.live_size()).sum();

    let mut candidates: Vec<_> = summaries
        .iter()
        .filter(|(file, _)| *file < params.upper_bound && !skip.contains(file))
        .collect();
    candidates.sort_by_key(|(file, summary)| (summary.utilization(), *file));

    let mut selected = Vec::new();
    for (file, summary) in candidates {
        if selected.len() >= params.max_files {
            break;
        }
        let total_utilization = if total_size == 0 {
            100
        } else {
            (live_size * 100 / total_size) as u32
        };
        if summary.utilization() >= params.min_file_utilization && total_utilization >= params.min_utilization {
            break;
        }
        selected.push(*file);
        // Cleaning moves the live bytes forward and drops the rest
        total_size -= summary.total_size - summary.live_size();
        live_size = live_size.min(total_size);
    }
    selected
}
