use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use crate::error::{ClaimError, Result};
use crate::text::clean_text;

/// Paragraphs shorter than this render as `=== heading ===` markers even
/// without a heading style, which keeps policy section titles visible to
/// the model.
const HEADING_CHAR_LIMIT: usize = 100;

/// Extract readable text from a DOCX file held in memory.
///
/// Body paragraphs come first, headings wrapped in `=== ... ===` markers,
/// followed by each table as a `--- TABLE n ---` block whose first row is
/// prefixed with `HEADERS:` and whose cells are joined with ` | `.
pub fn extract_docx_text(data: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| ClaimError::InvalidDocument("missing word/document.xml"))?
        .read_to_string(&mut xml)?;
    let body = parse_document_xml(&xml)?;
    Ok(render_body(&body))
}

struct DocxBody {
    paragraphs: Vec<Paragraph>,
    tables: Vec<Vec<Vec<String>>>,
}

struct Paragraph {
    text: String,
    heading: bool,
}

fn parse_document_xml(xml: &str) -> Result<DocxBody> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut paragraphs = Vec::new();
    let mut tables: Vec<Vec<Vec<String>>> = Vec::new();

    let mut table_depth = 0usize;
    let mut in_cell = false;
    let mut in_text = false;
    let mut heading_style = false;
    let mut para_buf = String::new();
    let mut cell_buf = String::new();
    let mut row: Vec<String> = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        tables.push(Vec::new());
                    }
                }
                b"w:tr" if table_depth == 1 => row.clear(),
                b"w:tc" if table_depth == 1 => {
                    in_cell = true;
                    cell_buf.clear();
                }
                b"w:p" => {
                    para_buf.clear();
                    heading_style = false;
                }
                b"w:t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:pStyle" => {
                    if let Some(style) = get_attr(&e, b"w:val") {
                        if style.starts_with("Heading") {
                            heading_style = true;
                        }
                    }
                }
                b"w:tab" => para_buf.push('\t'),
                b"w:br" | b"w:cr" => para_buf.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    para_buf.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    if in_cell {
                        if !para_buf.trim().is_empty() {
                            if !cell_buf.is_empty() {
                                cell_buf.push(' ');
                            }
                            cell_buf.push_str(para_buf.trim());
                        }
                    } else if table_depth == 0 && !para_buf.trim().is_empty() {
                        paragraphs.push(Paragraph {
                            heading: heading_style
                                || para_buf.chars().count() < HEADING_CHAR_LIMIT,
                            text: para_buf.trim().to_string(),
                        });
                    }
                    para_buf.clear();
                }
                b"w:tc" if table_depth == 1 => {
                    in_cell = false;
                    if !cell_buf.is_empty() {
                        row.push(std::mem::take(&mut cell_buf));
                    }
                }
                b"w:tr" if table_depth == 1 => {
                    if let Some(table) = tables.last_mut() {
                        table.push(std::mem::take(&mut row));
                    }
                }
                b"w:tbl" => table_depth = table_depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(ClaimError::Xml(err)),
            _ => {}
        }
        buf.clear();
    }

    Ok(DocxBody { paragraphs, tables })
}

fn render_body(body: &DocxBody) -> String {
    let mut parts = Vec::new();
    for para in &body.paragraphs {
        if para.heading {
            parts.push(format!("=== {} ===", para.text));
        } else {
            parts.push(para.text.clone());
        }
    }
    for (table_num, table) in body.tables.iter().enumerate() {
        parts.push(format!("--- TABLE {} ---", table_num + 1));
        for (row_num, row) in table.iter().enumerate() {
            if row.is_empty() {
                continue;
            }
            let joined = row.join(" | ");
            if row_num == 0 {
                parts.push(format!("HEADERS: {joined}"));
            } else {
                parts.push(joined);
            }
        }
    }
    clean_text(&parts.join("\n"))
}

fn get_attr(e: &quick_xml::events::BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .find(|a| a.as_ref().ok().map(|x| x.key.as_ref()) == Some(key))
        .and_then(std::result::Result::ok)
        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::{SimpleFileOptions, ZipWriter};

    use super::*;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    const LONG_PARA: &str = "Employees may claim reimbursement for reasonable \
business expenses incurred while travelling on company business, provided every \
claim is supported by an itemised receipt.";

    #[test]
    fn extracts_paragraphs_and_headings() {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Reimbursement Policy</w:t></w:r></w:p>
<w:p><w:r><w:t>{LONG_PARA}</w:t></w:r></w:p>
</w:body>
</w:document>"#
        );
        let text = extract_docx_text(&docx_bytes(&xml)).unwrap();
        assert_eq!(text, format!("=== Reimbursement Policy ===\n{LONG_PARA}"));
    }

    #[test]
    fn short_paragraph_becomes_heading_marker() {
        let xml = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body><w:p><w:r><w:t>Scope</w:t></w:r></w:p></w:body>
</w:document>"#;
        let text = extract_docx_text(&docx_bytes(xml)).unwrap();
        assert_eq!(text, "=== Scope ===");
    }

    #[test]
    fn renders_tables_with_header_row() {
        let xml = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
<w:tbl>
<w:tr><w:tc><w:p><w:r><w:t>Category</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Limit</w:t></w:r></w:p></w:tc></w:tr>
<w:tr><w:tc><w:p><w:r><w:t>Meals</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>50 EUR per day</w:t></w:r></w:p></w:tc></w:tr>
</w:tbl>
</w:body>
</w:document>"#;
        let text = extract_docx_text(&docx_bytes(xml)).unwrap();
        assert_eq!(
            text,
            "--- TABLE 1 ---\nHEADERS: Category | Limit\nMeals | 50 EUR per day"
        );
    }

    #[test]
    fn table_text_stays_out_of_paragraphs() {
        let xml = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
<w:tbl><w:tr><w:tc><w:p><w:r><w:t>cell only</w:t></w:r></w:p></w:tc></w:tr></w:tbl>
<w:p><w:r><w:t>After the table</w:t></w:r></w:p>
</w:body>
</w:document>"#;
        let text = extract_docx_text(&docx_bytes(xml)).unwrap();
        assert_eq!(
            text,
            "=== After the table ===\n--- TABLE 1 ---\nHEADERS: cell only"
        );
    }

    #[test]
    fn rejects_non_docx_bytes() {
        assert!(extract_docx_text(b"not a zip archive").is_err());
    }

    #[test]
    fn rejects_zip_without_document_xml() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("unrelated.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hello").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        match extract_docx_text(&bytes) {
            Err(ClaimError::InvalidDocument(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
