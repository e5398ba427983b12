//! Whole-store dumps for backup and analysis

use std::str::FromStr;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryRecord;

/// Serialization used by `export_all`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Pretty-printed JSON array of full records
    #[default]
    Json,
    /// Header row plus one row per record
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(Error::validation(
                "format",
                format!("unknown export format '{}' (expected json or csv)", other),
            )),
        }
    }
}

const CSV_HEADER: [&str; 10] = [
    "id",
    "type",
    "title",
    "content",
    "project",
    "tags",
    "sessionId",
    "createdAt",
    "updatedAt",
    "accessedAt",
];

/// Render `records` in `format`
pub fn render(records: &[MemoryRecord], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(records)?),
        ExportFormat::Csv => Ok(render_csv(records)),
    }
}

fn render_csv(records: &[MemoryRecord]) -> String {
    let mut out = String::new();
    push_row(&mut out, CSV_HEADER.iter().map(|h| h.to_string()));

    for record in records {
        let ts = |at: &chrono::DateTime<chrono::Utc>| at.to_rfc3339_opts(SecondsFormat::Micros, true);
        push_row(
            &mut out,
            [
                record.id.to_string(),
                record.memory_type.to_string(),
                record.title.clone(),
                record.content.clone(),
                record.project.clone(),
                record.tags.join(";"),
                record.session_id.map(|s| s.to_string()).unwrap_or_default(),
                ts(&record.created_at),
                ts(&record.updated_at),
                ts(&record.accessed_at),
            ],
        );
    }
    out
}

fn push_row(out: &mut String, fields: impl IntoIterator<Item = String>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&quote(&field));
    }
    out.push_str("\r\n");
}

/// RFC 4180 field quoting
fn quote(field: &str) -> String {
    if field.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{now, MemoryType};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn record(content: &str) -> MemoryRecord {
        let at = now();
        MemoryRecord {
            id: Uuid::nil(),
            memory_type: MemoryType::Decision,
            title: "Use RRF".into(),
            content: content.into(),
            project: "web".into(),
            tags: vec!["search".into(), "ranking".into()],
            session_id: None,
            created_at: at,
            updated_at: at,
            accessed_at: at,
        }
    }

    #[test]
    fn parses_formats() {
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(Error::Validation { field: "format", .. })
        ));
    }

    #[test]
    fn quotes_fields_that_need_it() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a,b"), "\"a,b\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(quote("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn csv_has_header_and_one_row_per_record() {
        let out = render(&[record("k=60, simple"), record("plain")], ExportFormat::Csv).unwrap();
        let lines: Vec<&str> = out.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,type,title,content"));
        assert!(lines[1].contains("\"k=60, simple\""));
        assert!(lines[1].contains(",search;ranking,"));
    }

    #[test]
    fn json_is_a_flat_list_of_full_records() {
        let out = render(&[record("body")], ExportFormat::Json).unwrap();
        let parsed: Vec<MemoryRecord> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].content, "body");
    }
}
