//! Multi-format serialization of fetched comments.
//!
//! Every encoding preserves fetch order. CSV and TXT carry a UTF-8 BOM so
//! spreadsheet tools pick the right charset.

use bytes::Bytes;
use chrono::SecondsFormat;

use crate::models::{CommentRecord, ExportFormat};
use crate::services::error::{AppError, ResultExt};

const UTF8_BOM: &str = "\u{feff}";
const COLUMNS: [&str; 4] = ["author", "text", "publishedAt", "likeCount"];

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub bytes: Bytes,
}

impl ExportArtifact {
    /// Object name for this artifact, e.g. `dQw4w9WgXcQ.csv`
    pub fn file_name(&self, video_id: &str) -> String {
        format!("{}.{}", video_id, self.format.extension())
    }
}

/// Encode `records` into every supported format.
pub fn encode_all(records: &[CommentRecord]) -> Result<Vec<ExportArtifact>, AppError> {
    ExportFormat::ALL
        .into_iter()
        .map(|format| {
            let bytes = encode(format, records)?;
            Ok(ExportArtifact { format, bytes })
        })
        .collect()
}

pub fn encode(format: ExportFormat, records: &[CommentRecord]) -> Result<Bytes, AppError> {
    let bytes = match format {
        ExportFormat::Csv => to_csv(records).into_bytes(),
        ExportFormat::Json => serde_json::to_vec_pretty(records).storage("Encode JSON export")?,
        ExportFormat::Txt => to_txt(records).into_bytes(),
        ExportFormat::Html => to_html(records).into_bytes(),
    };
    Ok(Bytes::from(bytes))
}

fn timestamp(record: &CommentRecord) -> String {
    record
        .published_at
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn to_csv(records: &[CommentRecord]) -> String {
    let mut out = String::from(UTF8_BOM);
    out.push_str(&COLUMNS.join(","));
    out.push('\n');

    for record in records {
        let row = [
            escape_csv(&record.author),
            escape_csv(&record.text),
            timestamp(record),
            record.like_count.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Escape a field for CSV output
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn to_txt(records: &[CommentRecord]) -> String {
    let mut out = String::from(UTF8_BOM);
    for record in records {
        out.push_str(&record.text);
        out.push('\n');
    }
    out
}

fn to_html(records: &[CommentRecord]) -> String {
    let mut out = String::from("<table border=\"1\" class=\"dataframe\">\n  <thead>\n    <tr style=\"text-align: right;\">\n");
    for column in COLUMNS {
        out.push_str(&format!("      <th>{}</th>\n", column));
    }
    out.push_str("    </tr>\n  </thead>\n  <tbody>\n");

    for record in records {
        out.push_str("    <tr>\n");
        for cell in [
            escape_html(&record.author),
            escape_html(&record.text),
            timestamp(record),
            record.like_count.to_string(),
        ] {
            out.push_str(&format!("      <td>{}</td>\n", cell));
        }
        out.push_str("    </tr>\n");
    }

    out.push_str("  </tbody>\n</table>\n");
    out
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn sample() -> Vec<CommentRecord> {
        vec![
            CommentRecord {
                author: "@alice".into(),
                text: "First!".into(),
                published_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
                like_count: 12,
            },
            CommentRecord {
                author: "Bob, the \"builder\"".into(),
                text: "line one\nline two, with comma".into(),
                published_at: Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap(),
                like_count: 0,
            },
            CommentRecord {
                author: "<script>".into(),
                text: "5 > 3 & 2 < 4".into(),
                published_at: Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap(),
                like_count: 1_000_000,
            },
        ]
    }

    /// Minimal RFC 4180 reader for checking the CSV export
    fn parse_csv(input: &str) -> Vec<Vec<String>> {
        let mut rows = Vec::new();
        let mut row = Vec::new();
        let mut field = String::new();
        let mut in_quotes = false;
        let mut chars = input.trim_start_matches(UTF8_BOM).chars().peekable();

        while let Some(c) = chars.next() {
            match (c, in_quotes) {
                ('"', true) if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                ('"', true) => in_quotes = false,
                ('"', false) => in_quotes = true,
                (',', false) => row.push(std::mem::take(&mut field)),
                ('\n', false) => {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                (c, _) => field.push(c),
            }
        }
        rows
    }

    fn records_from_csv(bytes: &[u8]) -> Vec<CommentRecord> {
        let text = std::str::from_utf8(bytes).unwrap();
        let rows = parse_csv(text);
        assert_eq!(rows[0], COLUMNS);
        rows[1..]
            .iter()
            .map(|row| CommentRecord {
                author: row[0].clone(),
                text: row[1].clone(),
                published_at: DateTime::parse_from_rfc3339(&row[2])
                    .unwrap()
                    .with_timezone(&Utc),
                like_count: row[3].parse().unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_encode_all_produces_every_format() {
        let artifacts = encode_all(&sample()).unwrap();
        let formats: Vec<_> = artifacts.iter().map(|a| a.format).collect();
        assert_eq!(formats, ExportFormat::ALL.to_vec());
        assert_eq!(artifacts[0].file_name("V1"), "V1.csv");
        assert_eq!(artifacts[3].file_name("V1"), "V1.html");
    }

    #[test]
    fn test_json_round_trip() {
        for records in [Vec::new(), sample()] {
            let bytes = encode(ExportFormat::Json, &records).unwrap();
            let decoded: Vec<CommentRecord> = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(decoded, records);
        }
    }

    #[test]
    fn test_csv_round_trip() {
        for records in [Vec::new(), sample()] {
            let bytes = encode(ExportFormat::Csv, &records).unwrap();
            assert!(bytes.starts_with(UTF8_BOM.as_bytes()));
            assert_eq!(records_from_csv(&bytes), records);
        }
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_txt_has_only_text_in_order() {
        let bytes = encode(ExportFormat::Txt, &sample()).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(
            text,
            "\u{feff}First!\nline one\nline two, with comma\n5 > 3 & 2 < 4\n"
        );
    }

    #[test]
    fn test_html_escapes_cells_and_keeps_order() {
        let bytes = encode(ExportFormat::Html, &sample()).unwrap();
        let html = std::str::from_utf8(&bytes).unwrap();

        assert!(html.starts_with("<table border=\"1\" class=\"dataframe\">"));
        assert!(html.contains("<th>publishedAt</th>"));
        assert!(html.contains("<td>&lt;script&gt;</td>"));
        assert!(html.contains("<td>5 &gt; 3 &amp; 2 &lt; 4</td>"));
        assert!(!html.contains("<script>"));

        let first = html.find("@alice").unwrap();
        let second = html.find("Bob, the &quot;builder&quot;").unwrap();
        assert!(first < second);
        assert_eq!(html.matches("<tr>").count(), 3);
    }
}
