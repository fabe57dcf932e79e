//! Per-combination throughput statistics.

use std::collections::BTreeMap;

use serde::Serialize;

use super::ExperimentKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub scheduler: String,
    pub congestion_control: String,
    pub file_size: String,
    pub samples: usize,
    pub min_throughput: f64,
    pub max_throughput: f64,
    pub avg_throughput: f64,
}

/// Min, max and mean per combination. Combinations without samples are left out.
pub fn summarize(results: &BTreeMap<ExperimentKey, Vec<f64>>) -> Vec<SummaryRow> {
    results
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(key, values)| SummaryRow {
            scheduler: key.scheduler().to_string(),
            congestion_control: key.congestion_control().to_string(),
            file_size: key.file_size().to_string(),
            samples: values.len(),
            min_throughput: values.iter().copied().fold(f64::INFINITY, f64::min),
            max_throughput: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg_throughput: values.iter().sum::<f64>() / values.len() as f64,
        })
        .collect()
}

const HEADERS: [&str; 6] = [
    "Scheduler",
    "Congestion Control",
    "File Size",
    "Min (MB/s)",
    "Max (MB/s)",
    "Avg (MB/s)",
];

/// Renders rows as a grid table for the log.
pub fn render_table(rows: &[SummaryRow]) -> String {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.scheduler.clone(),
                r.congestion_control.clone(),
                r.file_size.clone(),
                format!("{:.2}", r.min_throughput),
                format!("{:.2}", r.max_throughput),
                format!("{:.2}", r.avg_throughput),
            ]
        })
        .collect();

    render_grid(&HEADERS, &cells)
}

/// Renders a bordered grid with one column per header.
///
/// Cells beyond the header count are ignored; missing cells are left blank.
pub fn render_grid(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let rule = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let rule = format!("+{}+", rule);
    let line = |values: &[&str]| {
        let inner = widths
            .iter()
            .enumerate()
            .map(|(i, w)| format!(" {:<width$} ", values.get(i).unwrap_or(&""), width = w))
            .collect::<Vec<_>>()
            .join("|");
        format!("|{}|", inner)
    };

    let mut out = vec![rule.clone(), line(headers), rule.clone()];
    for row in rows {
        let values: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push(line(&values));
        out.push(rule.clone());
    }
    out.join("\n")
}
