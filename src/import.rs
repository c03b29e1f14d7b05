//! Bulk policy import from a `pg_dump`-style COPY block. The payload is the
//! text between the exact COPY marker line and the `\.` terminator: one
//! tab-separated record per line, `\N` for NULL, with the usual backslash
//! escapes. Each record is upserted by id, so re-running the same dump is a
//! no-op rather than a duplicate pile.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::policies::{Policy, PolicyRepository, PolicyStatus};

pub const COPY_MARKER: &str = "COPY public.policies (id, title, description, category, status, version, content, created_by, created_at, updated_at) FROM stdin;";

const FIELD_COUNT: usize = 10;
const PREVIEW_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ImportResult {
    Imported { success: bool, title: String },
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub count: usize,
    pub results: Vec<ImportResult>,
}

/// Undo COPY-format escaping. `\N` is handled by the caller before this runs.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn field(raw: &str) -> Option<String> {
    if raw == "\\N" { None } else { Some(unescape(raw)) }
}

/// Parse a COPY-format timestamp to epoch milliseconds. Dumps carry
/// `2024-01-15 10:30:00.123456+00`; RFC 3339 and bare naive timestamps are
/// accepted as fallbacks, the latter read as UTC.
fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_millis());
    }
    None
}

fn preview_of(line: &str) -> String {
    line.chars().take(PREVIEW_LEN).collect()
}

/// Extract the record lines between the marker and the `\.` terminator.
fn extract_block(dump: &str) -> AppResult<Vec<String>> {
    let Some(start) = dump.find(COPY_MARKER) else {
        return Err(AppError::validation(
            "copy_block_missing",
            "could not find the policies COPY block in the dump",
        ));
    };
    let after_marker = &dump[start + COPY_MARKER.len()..];
    let Some(end) = after_marker.find("\n\\.") else {
        return Err(AppError::validation(
            "copy_terminator_missing",
            "COPY block is not terminated with \\.",
        ));
    };
    Ok(after_marker[..end]
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect())
}

fn parse_line(line: &str) -> Result<Policy, ImportResult> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < FIELD_COUNT {
        return Err(ImportResult::Failed {
            error: format!("expected {FIELD_COUNT} tab-separated fields, found {}", fields.len()),
            title: None,
            preview: Some(preview_of(line)),
        });
    }
    let title = field(fields[1]).unwrap_or_default();
    let fail = |error: String| ImportResult::Failed {
        error,
        title: Some(title.clone()),
        preview: None,
    };
    let id = field(fields[0]).filter(|s| !s.is_empty()).ok_or_else(|| fail("record has no id".into()))?;
    let status = field(fields[4])
        .as_deref()
        .and_then(PolicyStatus::parse)
        .ok_or_else(|| fail(format!("unknown status {:?}", fields[4])))?;
    let created_at = field(fields[8])
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| fail(format!("unparseable created_at {:?}", fields[8])))?;
    let updated_at = field(fields[9])
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| fail(format!("unparseable updated_at {:?}", fields[9])))?;
    Ok(Policy {
        id,
        title,
        description: field(fields[2]).unwrap_or_default(),
        category: field(fields[3]).unwrap_or_default(),
        status,
        version: field(fields[5]).unwrap_or_default(),
        content: field(fields[6]).unwrap_or_default(),
        created_by: field(fields[7]),
        created_at,
        updated_at,
    })
}

/// Run a full import. A malformed line yields a per-line error entry and the
/// remaining lines still import; only a missing block or terminator aborts.
/// `count` is the number of data lines processed, failures included; the
/// per-line outcome lives in `results`.
pub fn import_policies(repo: &PolicyRepository, dump: &str) -> AppResult<ImportReport> {
    let lines = extract_block(dump)?;
    let mut results = Vec::with_capacity(lines.len());
    let mut imported = 0usize;
    for line in &lines {
        match parse_line(line) {
            Ok(policy) => {
                let title = policy.title.clone();
                match repo.upsert_imported(policy) {
                    Ok(()) => {
                        imported += 1;
                        results.push(ImportResult::Imported { success: true, title });
                    }
                    Err(e) => results.push(ImportResult::Failed {
                        error: e.message().to_string(),
                        title: Some(title),
                        preview: None,
                    }),
                }
            }
            Err(failure) => results.push(failure),
        }
    }
    info!(target: "policydesk::import", "import.done imported={} of {}", imported, lines.len());
    Ok(ImportReport { count: lines.len(), results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use crate::storage::SharedStore;

    fn repo() -> (tempfile::TempDir, PolicyRepository) {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedStore::new(tmp.path()).unwrap();
        (tmp, PolicyRepository::new(shared))
    }

    fn dump_with(lines: &[&str]) -> String {
        format!("{}\n{}\n\\.\n", COPY_MARKER, lines.join("\n"))
    }

    const GOOD_LINE: &str = "11111111-1111-1111-1111-111111111111\tHand Hygiene\tWash hands\tInfection Control\tactive\t1.0\tLine one\\nLine two\t\\N\t2024-01-15 10:30:00+00\t2024-02-01 09:00:00+00";

    #[test]
    fn imports_a_well_formed_dump() {
        let (_tmp, repo) = repo();
        let report = import_policies(&repo, &dump_with(&[GOOD_LINE])).unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(report.results, vec![ImportResult::Imported { success: true, title: "Hand Hygiene".into() }]);

        let listed = repo.list(Role::Admin).unwrap();
        assert_eq!(listed.len(), 1);
        let p = &listed[0];
        assert_eq!(p.id, "11111111-1111-1111-1111-111111111111");
        assert_eq!(p.content, "Line one\nLine two");
        assert_eq!(p.created_by, None);
        assert_eq!(p.status, PolicyStatus::Active);
        assert!(p.created_at < p.updated_at);
    }

    #[test]
    fn rerunning_the_same_dump_is_idempotent() {
        let (_tmp, repo) = repo();
        import_policies(&repo, &dump_with(&[GOOD_LINE])).unwrap();
        let report = import_policies(&repo, &dump_with(&[GOOD_LINE])).unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(repo.list(Role::Admin).unwrap().len(), 1);
    }

    #[test]
    fn short_line_fails_alone_with_a_preview() {
        let (_tmp, repo) = repo();
        let short = "only\tfour\tfields\there";
        let report = import_policies(&repo, &dump_with(&[short, GOOD_LINE])).unwrap();
        // the count covers every processed line, the failed one included
        assert_eq!(report.count, 2);
        assert_eq!(report.results.len(), report.count);
        match &report.results[0] {
            ImportResult::Failed { error, preview, .. } => {
                assert!(error.contains("found 4"));
                assert_eq!(preview.as_deref(), Some(short));
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert_eq!(repo.list(Role::Admin).unwrap().len(), 1);
    }

    #[test]
    fn missing_marker_or_terminator_aborts() {
        let (_tmp, repo) = repo();
        let err = import_policies(&repo, "not a dump at all").unwrap_err();
        assert_eq!(err.code_str(), "copy_block_missing");

        let unterminated = format!("{COPY_MARKER}\n{GOOD_LINE}\n");
        let err = import_policies(&repo, &unterminated).unwrap_err();
        assert_eq!(err.code_str(), "copy_terminator_missing");
        assert!(repo.list(Role::Admin).unwrap().is_empty());
    }

    #[test]
    fn long_preview_is_clipped_to_fifty_chars() {
        let (_tmp, repo) = repo();
        let long = "x".repeat(200);
        let report = import_policies(&repo, &dump_with(&[long.as_str()])).unwrap();
        match &report.results[0] {
            ImportResult::Failed { preview, .. } => {
                assert_eq!(preview.as_deref().map(|p| p.len()), Some(50));
            }
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn unescape_handles_copy_escapes() {
        assert_eq!(unescape("a\\nb"), "a\nb");
        assert_eq!(unescape("a\\tb"), "a\tb");
        assert_eq!(unescape("a\\\\n"), "a\\n");
        assert_eq!(field("\\N"), None);
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_timestamp("2024-01-15 10:30:00.123456+00").is_some());
        assert!(parse_timestamp("2024-01-15T10:30:00Z").is_some());
        assert!(parse_timestamp("2024-01-15 10:30:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
