//! Documentation chunking: extract headings, paragraphs, code blocks and
//! tables, then group them into chunks bounded by a character budget
//! without splitting a unit mid-item.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::CHUNK_CHAR_BUDGET;
use crate::utils::text_utils::TextUtils;

lazy_static! {
    static ref SCRIPT_STYLE_REGEX: Regex =
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap();
    static ref TAG_REGEX: Regex = Regex::new(r"(?s)<[^>]+>").unwrap();
    static ref HTML_HEADING_REGEX: Regex =
        Regex::new(r"(?is)<h[1-6][^>]*>(.*?)</h[1-6]>").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Heading,
    Paragraph,
    Code,
    Table,
}

impl BlockKind {
    fn label(&self) -> &'static str {
        match self {
            BlockKind::Heading => "heading",
            BlockKind::Paragraph => "paragraph",
            BlockKind::Code => "code",
            BlockKind::Table => "table",
        }
    }
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocChunk {
    pub content: String,
    #[serde(rename = "type")]
    pub chunk_type: String,
}

/// Reduce an HTML or markdown source to plain blocks. HTML headings are
/// rewritten as markdown headings before tags are stripped so the block
/// extractor sees them.
fn sanitize(source: &str) -> String {
    let no_scripts = SCRIPT_STYLE_REGEX.replace_all(source, "\n");
    let with_headings = HTML_HEADING_REGEX.replace_all(&no_scripts, "\n## $1\n");
    let no_tags = TAG_REGEX.replace_all(&with_headings, " ");
    no_tags
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

fn extract_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut table: Vec<&str> = Vec::new();
    let mut code: Vec<&str> = Vec::new();
    let mut in_code = false;

    let flush_paragraph = |lines: &mut Vec<&str>, blocks: &mut Vec<Block>| {
        if !lines.is_empty() {
            let joined = lines.join(" ");
            let normalized = TextUtils::normalize_whitespace(&joined);
            if !normalized.is_empty() {
                blocks.push(Block {
                    kind: BlockKind::Paragraph,
                    text: normalized.into_owned(),
                });
            }
            lines.clear();
        }
    };
    let flush_table = |lines: &mut Vec<&str>, blocks: &mut Vec<Block>| {
        if !lines.is_empty() {
            blocks.push(Block {
                kind: BlockKind::Table,
                text: lines.join("\n"),
            });
            lines.clear();
        }
    };

    for line in text.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            if in_code {
                blocks.push(Block {
                    kind: BlockKind::Code,
                    text: code.join("\n"),
                });
                code.clear();
                in_code = false;
            } else {
                flush_paragraph(&mut paragraph, &mut blocks);
                flush_table(&mut table, &mut blocks);
                in_code = true;
            }
            continue;
        }
        if in_code {
            code.push(line);
            continue;
        }

        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_table(&mut table, &mut blocks);
            continue;
        }

        if trimmed.starts_with('#') {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_table(&mut table, &mut blocks);
            let heading = trimmed.trim_start_matches('#').trim();
            if !heading.is_empty() {
                blocks.push(Block {
                    kind: BlockKind::Heading,
                    text: heading.to_string(),
                });
            }
            continue;
        }

        if trimmed.starts_with('|') {
            flush_paragraph(&mut paragraph, &mut blocks);
            table.push(trimmed);
            continue;
        }

        flush_table(&mut table, &mut blocks);
        paragraph.push(trimmed);
    }

    flush_paragraph(&mut paragraph, &mut blocks);
    flush_table(&mut table, &mut blocks);
    if in_code && !code.is_empty() {
        blocks.push(Block {
            kind: BlockKind::Code,
            text: code.join("\n"),
        });
    }

    blocks
}

/// Chunk a documentation source. Blocks are grouped greedily under the
/// character budget; a single oversized block becomes its own chunk
/// rather than being split mid-item. Headings stay with the content that
/// follows them.
pub fn chunk_document(source: &str) -> Vec<DocChunk> {
    let sanitized = sanitize(source);
    let blocks = extract_blocks(&sanitized);

    let mut chunks = Vec::new();
    let mut current: Vec<&Block> = Vec::new();
    let mut current_len = 0usize;

    let flush = |group: &mut Vec<&Block>, chunks: &mut Vec<DocChunk>| {
        if group.is_empty() {
            return;
        }
        let content = group
            .iter()
            .map(|b| match b.kind {
                BlockKind::Heading => format!("## {}", b.text),
                _ => b.text.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        // Typed by the first non-heading block.
        let chunk_type = group
            .iter()
            .map(|b| b.kind)
            .find(|k| *k != BlockKind::Heading)
            .unwrap_or(BlockKind::Heading)
            .label()
            .to_string();
        chunks.push(DocChunk {
            content,
            chunk_type,
        });
        group.clear();
    };

    for block in &blocks {
        let block_len = block.text.len();
        if current_len + block_len > CHUNK_CHAR_BUDGET && !current.is_empty() {
            // Do not strand a trailing heading away from its section.
            let trailing_heading = if current.last().map(|b| b.kind) == Some(BlockKind::Heading) {
                current.pop()
            } else {
                None
            };
            flush(&mut current, &mut chunks);
            current_len = 0;
            if let Some(heading) = trailing_heading {
                current_len += heading.text.len();
                current.push(heading);
            }
        }
        current_len += block_len;
        current.push(block);
    }
    flush(&mut current, &mut chunks);

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_blocks() {
        let source = "# ATT\n\nAttitude data from the AHRS.\n\n| Field | Unit |\n| Roll | deg |\n\n```\nSELECT Roll FROM att_data\n```\n";
        let chunks = chunk_document(source);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("## ATT"));
        assert!(chunks[0].content.contains("Attitude data"));
        assert!(chunks[0].content.contains("| Roll | deg |"));
        assert!(chunks[0].content.contains("SELECT Roll"));
    }

    #[test]
    fn test_chunks_respect_budget() {
        let mut source = String::new();
        for i in 0..40 {
            source.push_str(&format!(
                "Paragraph {} about telemetry fields with enough text to take real space in a chunk budget measurement pass.\n\n",
                i
            ));
        }
        let chunks = chunk_document(&source);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Budget plus joining overhead; no chunk may run away.
            assert!(chunk.content.len() <= CHUNK_CHAR_BUDGET + 200);
        }
    }

    #[test]
    fn test_oversized_block_is_not_split() {
        let big_paragraph = "x".repeat(CHUNK_CHAR_BUDGET * 2);
        let source = format!("intro\n\n{}\n\noutro", big_paragraph);
        let chunks = chunk_document(&source);
        assert!(chunks
            .iter()
            .any(|c| c.content.len() >= CHUNK_CHAR_BUDGET * 2));
    }

    #[test]
    fn test_heading_stays_with_following_content() {
        let filler = "y".repeat(CHUNK_CHAR_BUDGET - 20);
        let source = format!("{}\n\n# GPS\n\nPosition fix data.", filler);
        let chunks = chunk_document(&source);
        let gps_chunk = chunks
            .iter()
            .find(|c| c.content.contains("## GPS"))
            .expect("heading chunk");
        assert!(gps_chunk.content.contains("Position fix data."));
    }

    #[test]
    fn test_html_is_sanitized() {
        let source = "<html><head><style>body{}</style></head><body><h2>BAT</h2><p>Battery &amp; power data.</p></body></html>";
        let chunks = chunk_document(source);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("## BAT"));
        assert!(chunks[0].content.contains("Battery & power data."));
        assert!(!chunks[0].content.contains("body{}"));
    }

    #[test]
    fn test_chunk_type_labels() {
        let chunks = chunk_document("| a | b |\n| 1 | 2 |");
        assert_eq!(chunks[0].chunk_type, "table");
        let chunks = chunk_document("plain text paragraph");
        assert_eq!(chunks[0].chunk_type, "paragraph");
    }

    #[test]
    fn test_empty_source() {
        assert!(chunk_document("").is_empty());
        assert!(chunk_document("   \n\n  ").is_empty());
    }
}
