//! Text chunking for per-request length limits
//!
//! Providers cap how much text one synthesis request may carry. Long
//! responses are split on sentence boundaries where possible, then on
//! words, and only as a last resort inside a word.

/// `OpenAI` speech endpoint input limit, in characters
pub const OPENAI_MAX_CHARS: usize = 4096;

/// Split `text` into chunks of at most `limit` bytes
///
/// Byte length bounds character length, so chunks also fit a character
/// limit. Every returned chunk is non-empty; empty input yields no chunks.
#[must_use]
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let text = text.trim();

    if text.is_empty() {
        return Vec::new();
    }

    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_on_sentences(text) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        let needed = if current.is_empty() {
            sentence.len()
        } else {
            current.len() + 1 + sentence.len()
        };

        if needed <= limit {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if sentence.len() <= limit {
            current.push_str(sentence);
        } else {
            chunks.extend(chunk_words(sentence, limit));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Split on sentence-ending punctuation (`. `, `! `, `? `), keeping the
/// punctuation attached to the preceding segment
fn split_on_sentences(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    let mut i = 0;
    while i < bytes.len().saturating_sub(1) {
        if matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1].is_ascii_whitespace() {
            let end = i + 1;
            segments.push(&text[start..end]);
            start = end;
        }
        i += 1;
    }

    if start < text.len() {
        segments.push(&text[start..]);
    }

    segments
}

/// Split an over-long sentence on whitespace, hard-splitting long words
fn chunk_words(sentence: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in sentence.split_whitespace() {
        let needed = if current.is_empty() {
            word.len()
        } else {
            current.len() + 1 + word.len()
        };

        if needed <= limit {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if word.len() <= limit {
            current.push_str(word);
        } else {
            chunks.extend(chunk_hard(word, limit));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Split at `limit` bytes, backing off to a char boundary
fn chunk_hard(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= limit {
            chunks.push(remaining.to_string());
            break;
        }

        let mut split = limit;
        while split > 0 && !remaining.is_char_boundary(split) {
            split -= 1;
        }
        if split == 0 {
            // Limit smaller than one character; take the whole character
            split = remaining.chars().next().map_or(remaining.len(), char::len_utf8);
        }

        chunks.push(remaining[..split].to_string());
        remaining = &remaining[split..];
    }

    chunks
}
