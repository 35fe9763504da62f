//! Post-processing of token surface strings.

use std::sync::LazyLock;

use regex::Regex;

/// Continuation and word-start markers added by common subword tokenizers
/// (`##` `WordPiece`, `Ġ` byte-level BPE, `▁` `SentencePiece`, `__` Marian).
const PREFIX_MARKERS: [&str; 4] = ["##", "Ġ", "__", "▁"];

/// Tokens made only of digits and `.`/`,`, e.g. `22,` or `3.5`.
static NUMERIC_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d|[.,])+$").expect("numeric pattern should compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizeOptions {
    pub strip_prefixes: bool,
    /// Split trailing `.`/`,` off numeric tokens. Some sentencepiece vocabularies
    /// glue a comma onto the preceding number (`22,`).
    pub split_numeric_punctuation: bool,
}

impl Default for TokenizeOptions {
    fn default() -> Self {
        Self {
            strip_prefixes: false,
            split_numeric_punctuation: true,
        }
    }
}

#[must_use]
pub fn strip_prefixes(token: &str) -> String {
    PREFIX_MARKERS
        .iter()
        .fold(token.to_string(), |acc, marker| acc.replace(marker, ""))
}

/// Split `22,` into `22` and `,`. Separators become their own tokens and
/// empty pieces are dropped.
fn split_numeric(token: &str, out: &mut Vec<String>) {
    let mut piece = String::new();
    for c in token.chars() {
        if c == '.' || c == ',' {
            if !piece.is_empty() {
                out.push(std::mem::take(&mut piece));
            }
            out.push(c.to_string());
        } else {
            piece.push(c);
        }
    }
    if !piece.is_empty() {
        out.push(piece);
    }
}

#[must_use]
pub fn split_numeric_punctuation(tokens: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token.is_empty() {
            continue;
        }
        if NUMERIC_PUNCT.is_match(&token) {
            split_numeric(&token, &mut out);
        } else {
            out.push(token);
        }
    }
    out
}

/// Apply `options` to each example's token list.
#[must_use]
pub fn postprocess(tokens: Vec<Vec<String>>, options: TokenizeOptions) -> Vec<Vec<String>> {
    tokens
        .into_iter()
        .map(|example| {
            let example = if options.strip_prefixes {
                example.iter().map(|t| strip_prefixes(t)).collect()
            } else {
                example
            };
            if options.split_numeric_punctuation {
                split_numeric_punctuation(example)
            } else {
                example
            }
        })
        .collect()
}
