//! Pure line-oriented diff engine (§4.4). No I/O, no knowledge of sessions
//! or storage.

use crate::types::{DiffResult, DiffSpan, DiffSpanKind};

const CONTEXT_LINES: usize = 3;
const ELLIPSIS_THRESHOLD: usize = 6;

/// Normalise line endings and split into lines, the way the contract
/// requires before any comparison happens.
fn normalize_lines(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.is_empty() {
        Vec::new()
    } else {
        normalized.split('\n').map(str::to_string).collect()
    }
}

/// Compare two configuration documents and produce a simplified unified
/// diff plus a changed/unchanged flag.
#[must_use]
pub fn diff_configs(old: &str, new: &str) -> DiffResult {
    let old_norm = old.replace("\r\n", "\n").replace('\r', "\n");
    let new_norm = new.replace("\r\n", "\n").replace('\r', "\n");

    if old_norm == new_norm {
        return DiffResult {
            diff_text: String::new(),
            has_changes: false,
        };
    }

    let old_lines = normalize_lines(&old_norm);
    let new_lines = normalize_lines(&new_norm);
    let spans = line_level_diff(&old_lines, &new_lines);
    let diff_text = render_spans(&spans);

    DiffResult {
        diff_text,
        has_changes: true,
    }
}

/// Longest-common-subsequence walk producing Delete/Insert/Equal spans, the
/// minimal diff algorithm that satisfies the contract's span semantics.
fn line_level_diff(old: &[String], new: &[String]) -> Vec<DiffSpan> {
    let lcs = lcs_table(old, new);
    let mut ops: Vec<(DiffSpanKind, String)> = Vec::new();
    let (mut i, mut j) = (old.len(), new.len());

    while i > 0 && j > 0 {
        if old[i - 1] == new[j - 1] {
            ops.push((DiffSpanKind::Equal, old[i - 1].clone()));
            i -= 1;
            j -= 1;
        } else if lcs[i - 1][j] >= lcs[i][j - 1] {
            ops.push((DiffSpanKind::Delete, old[i - 1].clone()));
            i -= 1;
        } else {
            ops.push((DiffSpanKind::Insert, new[j - 1].clone()));
            j -= 1;
        }
    }
    while i > 0 {
        ops.push((DiffSpanKind::Delete, old[i - 1].clone()));
        i -= 1;
    }
    while j > 0 {
        ops.push((DiffSpanKind::Insert, new[j - 1].clone()));
        j -= 1;
    }
    ops.reverse();

    coalesce(ops)
}

fn lcs_table(old: &[String], new: &[String]) -> Vec<Vec<u32>> {
    let (m, n) = (old.len(), new.len());
    let mut table = vec![vec![0u32; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            table[i][j] = if old[i - 1] == new[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table
}

fn coalesce(ops: Vec<(DiffSpanKind, String)>) -> Vec<DiffSpan> {
    let mut spans: Vec<DiffSpan> = Vec::new();
    for (kind, line) in ops {
        match spans.last_mut() {
            Some(span) if kind_eq(&span.kind, &kind) => span.lines.push(line),
            _ => spans.push(DiffSpan {
                kind,
                lines: vec![line],
            }),
        }
    }
    spans
}

fn kind_eq(a: &DiffSpanKind, b: &DiffSpanKind) -> bool {
    matches!(
        (a, b),
        (DiffSpanKind::Delete, DiffSpanKind::Delete)
            | (DiffSpanKind::Insert, DiffSpanKind::Insert)
            | (DiffSpanKind::Equal, DiffSpanKind::Equal)
    )
}

/// Emit the simplified text diff described in §4.4 step 4.
fn render_spans(spans: &[DiffSpan]) -> String {
    let mut out = Vec::new();
    for span in spans {
        match span.kind {
            DiffSpanKind::Delete => {
                for line in &span.lines {
                    if line.is_empty() {
                        continue;
                    }
                    out.push(format!("- {line}"));
                }
            }
            DiffSpanKind::Insert => {
                for line in &span.lines {
                    if line.is_empty() {
                        continue;
                    }
                    out.push(format!("+ {line}"));
                }
            }
            DiffSpanKind::Equal => {
                render_equal_span(&span.lines, &mut out);
            }
        }
    }
    out.join("\n")
}

fn render_equal_span(lines: &[String], out: &mut Vec<String>) {
    if lines.len() <= ELLIPSIS_THRESHOLD {
        for line in lines {
            out.push(format!("  {line}"));
        }
        return;
    }
    for line in lines.iter().take(CONTEXT_LINES) {
        out.push(format!("  {line}"));
    }
    out.push("  ...".to_string());
    for line in lines.iter().skip(lines.len() - CONTEXT_LINES) {
        out.push(format!("  {line}"));
    }
}

/// Convert the `- ` / `+ ` text diff into the admin-style presentation
/// (`[delete] ` / `[set] `).
#[must_use]
pub fn format_admin_style(diff_text: &str) -> String {
    diff_text
        .lines()
        .map(|line| {
            if let Some(rest) = line.strip_prefix("- ") {
                format!("[delete] {rest}")
            } else if let Some(rest) = line.strip_prefix("+ ") {
                format!("[set] {rest}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_no_changes() {
        let result = diff_configs("set a\nset b", "set a\nset b");
        assert!(!result.has_changes);
        assert_eq!(result.diff_text, "");
    }

    #[test]
    fn crlf_and_cr_are_normalized_before_comparison() {
        let result = diff_configs("set a\r\nset b", "set a\nset b");
        assert!(!result.has_changes);
    }

    #[test]
    fn pure_insert_produces_plus_lines() {
        let result = diff_configs("set a", "set a\nset b");
        assert!(result.has_changes);
        assert!(result.diff_text.contains("+ set b"));
        assert!(result.diff_text.contains("  set a"));
    }

    #[test]
    fn pure_delete_produces_minus_lines() {
        let result = diff_configs("set a\nset b", "set a");
        assert!(result.diff_text.contains("- set b"));
    }

    #[test]
    fn long_equal_span_is_elided() {
        let old_lines: Vec<String> = (0..10).map(|i| format!("line{i}")).collect();
        let mut new_lines = old_lines.clone();
        new_lines.push("line10".to_string());
        let result = diff_configs(&old_lines.join("\n"), &new_lines.join("\n"));
        assert!(result.diff_text.contains("  ..."));
        assert!(result.diff_text.contains("+ line10"));
    }

    #[test]
    fn admin_style_reformats_prefixes() {
        let rendered = format_admin_style("- set old\n+ set new\n  set same");
        assert_eq!(rendered, "[delete] set old\n[set] set new\n  set same");
    }
}
