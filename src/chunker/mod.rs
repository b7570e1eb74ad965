use std::collections::HashMap;

/// Default chunk target size in characters (~500 tokens).
pub const DEFAULT_TARGET_CHARS: usize = 2000;

/// Default overlap carried between consecutive chunks, in characters.
pub const DEFAULT_OVERLAP_CHARS: usize = 200;

/// Input format hint for the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextFormat {
    #[default]
    Plain,
    Markdown,
}

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub format: TextFormat,
    pub target_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            format: TextFormat::Plain,
            target_chars: DEFAULT_TARGET_CHARS,
            overlap_chars: DEFAULT_OVERLAP_CHARS,
        }
    }
}

/// A chunk of text ready for embedding and indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Small key/value map; markdown chunks carry the nearest preceding
    /// heading under `section`.
    pub metadata: HashMap<String, String>,
}

/// Split `text` into overlapping chunks.
///
/// Paragraphs (blank-line separated) are accumulated until adding the next
/// would exceed `target_chars`, then the buffer is emitted. The last
/// `overlap_chars` characters of the previous chunk prefix the next one. A
/// paragraph larger than the target is emitted as a single chunk; splitting
/// inside a paragraph loses too much local context to be worth it.
///
/// In markdown mode a heading line closes the current chunk, updates the
/// tracked section, and starts the next chunk with the heading itself.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    match opts.format {
        TextFormat::Plain => {
            let paragraphs = split_paragraphs(text);
            emit_chunks(&paragraphs, None, opts)
        }
        TextFormat::Markdown => chunk_markdown(text, opts),
    }
}

fn chunk_markdown(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut section: Option<String> = None;
    // Paragraphs accumulated since the last heading boundary.
    let mut run: Vec<String> = Vec::new();

    let mut flush = |run: &mut Vec<String>, section: &Option<String>, chunks: &mut Vec<Chunk>| {
        if !run.is_empty() {
            chunks.extend(emit_chunks(run, section.as_deref(), opts));
            run.clear();
        }
    };

    for paragraph in split_paragraphs(text) {
        // A heading can open a paragraph that continues with body lines;
        // peel it off so the boundary lands exactly on the heading.
        if let Some(title) = heading_title(&paragraph) {
            flush(&mut run, &section, &mut chunks);
            section = Some(title);
            run.push(paragraph);
        } else {
            run.push(paragraph);
        }
    }
    flush(&mut run, &section, &mut chunks);

    chunks
}

/// Accumulate paragraphs into chunks of roughly `target_chars`, threading
/// the overlap prefix between emissions.
fn emit_chunks(paragraphs: &[String], section: Option<&str>, opts: &ChunkOptions) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut buffer_len = 0usize;
    let mut overlap = String::new();

    let metadata = |section: Option<&str>| {
        let mut map = HashMap::new();
        if let Some(s) = section {
            map.insert("section".to_string(), s.to_string());
        }
        map
    };

    let mut emit = |buffer: &mut Vec<&str>, buffer_len: &mut usize, overlap: &mut String| {
        if buffer.is_empty() {
            return None;
        }
        let body = buffer.join("\n\n");
        let text = if overlap.is_empty() {
            body
        } else {
            format!("{overlap}\n\n{body}")
        };
        let text = text.trim().to_string();
        *overlap = tail_chars(&text, opts.overlap_chars).to_string();
        buffer.clear();
        *buffer_len = 0;
        if text.is_empty() {
            None
        } else {
            Some(Chunk {
                text,
                metadata: metadata(section),
            })
        }
    };

    for paragraph in paragraphs {
        let len = paragraph.chars().count();

        if buffer_len + len > opts.target_chars && !buffer.is_empty() {
            chunks.extend(emit(&mut buffer, &mut buffer_len, &mut overlap));
        }

        buffer.push(paragraph);
        buffer_len += len;

        // Oversize paragraphs go out whole rather than being split inside.
        if len > opts.target_chars {
            chunks.extend(emit(&mut buffer, &mut buffer_len, &mut overlap));
        }
    }

    chunks.extend(emit(&mut buffer, &mut buffer_len, &mut overlap));
    chunks
}

/// Split on blank lines, trimming each paragraph and dropping empties.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    paragraphs
}

/// The heading text if the paragraph's first line is `#`..`######` followed
/// by whitespace, without the marker.
fn heading_title(paragraph: &str) -> Option<String> {
    let first = paragraph.lines().next()?;
    let hashes = first.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &first[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// The last `n` characters of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let total = s.chars().count();
    if total <= n {
        return s;
    }
    let skip = total - n;
    let (idx, _) = s.char_indices().nth(skip).unwrap_or((s.len(), ' '));
    &s[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(target: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            format: TextFormat::Plain,
            target_chars: target,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(chunk_text("", &ChunkOptions::default()).is_empty());
        assert!(chunk_text("  \n\n  ", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello world", &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert!(chunks[0].metadata.is_empty());
    }

    #[test]
    fn paragraphs_accumulate_until_target() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chunks = chunk_text(&text, &opts(10, 0));
        // 4 + 4 fits, adding the third paragraph would exceed 10.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "aaaa\n\nbbbb");
        assert_eq!(chunks[1].text, "cccc");
    }

    #[test]
    fn overlap_prefixes_next_chunk() {
        let text = "alpha beta\n\ngamma delta\n\nepsilon";
        let chunks = chunk_text(&text, &opts(22, 4));
        assert!(chunks.len() >= 2);
        let tail: String = chunks[0].text.chars().rev().take(4).collect();
        let tail: String = tail.chars().rev().collect();
        assert!(chunks[1].text.starts_with(&tail));
    }

    #[test]
    fn oversize_paragraph_emitted_whole() {
        let big = "x".repeat(50);
        let text = format!("small\n\n{big}\n\ntiny");
        let chunks = chunk_text(&text, &opts(20, 0));
        assert!(chunks.iter().any(|c| c.text.contains(&big)));
        // The oversize paragraph was not split.
        let holder = chunks.iter().find(|c| c.text.contains(&big)).unwrap();
        assert!(holder.text.len() >= 50);
    }

    #[test]
    fn never_emits_empty_chunks() {
        let text = "a\n\n\n\n\n\nb";
        let chunks = chunk_text(&text, &opts(1, 0));
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn markdown_tracks_sections() {
        let text = "# Intro\n\nfirst paragraph\n\n## Details\n\nsecond paragraph";
        let chunks = chunk_text(
            &text,
            &ChunkOptions {
                format: TextFormat::Markdown,
                ..ChunkOptions::default()
            },
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata["section"], "Intro");
        assert_eq!(chunks[1].metadata["section"], "Details");
    }

    #[test]
    fn heading_belongs_to_following_chunk() {
        let text = "body before\n\n# Heading\n\nbody after";
        let chunks = chunk_text(
            &text,
            &ChunkOptions {
                format: TextFormat::Markdown,
                ..ChunkOptions::default()
            },
        );
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].text.contains("# Heading"));
        assert!(chunks[1].text.starts_with("# Heading"));
        assert!(chunks[0].metadata.get("section").is_none());
    }

    #[test]
    fn heading_forces_boundary_below_target() {
        let text = "tiny\n\n## Next\n\nmore";
        let chunks = chunk_text(
            &text,
            &ChunkOptions {
                format: TextFormat::Markdown,
                target_chars: 10_000,
                overlap_chars: 0,
            },
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].metadata["section"], "Next");
    }

    #[test]
    fn hash_without_space_is_not_a_heading() {
        assert!(heading_title("#hashtag not a heading").is_none());
        assert!(heading_title("####### seven").is_none());
        assert_eq!(heading_title("### Title  ").as_deref(), Some("Title"));
    }

    #[test]
    fn tail_chars_respects_boundaries() {
        assert_eq!(tail_chars("hello", 3), "llo");
        assert_eq!(tail_chars("hé", 1), "é");
        assert_eq!(tail_chars("ab", 10), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }
}
