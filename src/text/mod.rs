//! Mixed-script segmentation for keyword search
//!
//! Whitespace-delimited scripts are split on Unicode word boundaries. Runs of
//! CJK ideographs and kana carry no word delimiters, so they are indexed and
//! queried as overlapping character bigrams. The same segmentation is used on
//! both the index side and the query side.

mod stopwords;

use crate::config::KeywordConfig;
use ahash::{HashSet, HashSetExt};
use unicode_segmentation::UnicodeSegmentation;

use stopwords::{CJK_PARTICLES, STOP_WORDS};

/// Tokenizer with a configured stop-word set
#[derive(Debug, Clone)]
pub struct Segmenter {
    stop_words: HashSet<String>,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Segmenter {
    /// Built-in stop words plus `extra`
    pub fn new(extra: &[String]) -> Self {
        let mut stop_words = HashSet::with_capacity(STOP_WORDS.len() + extra.len());
        stop_words.extend(STOP_WORDS.iter().map(|w| w.to_string()));
        stop_words.extend(extra.iter().map(|w| w.to_lowercase()));
        Self { stop_words }
    }

    pub fn from_config(config: &KeywordConfig) -> Self {
        Self::new(&config.extra_stop_words)
    }

    /// Lowercased tokens in text order, stop words included
    pub fn segment(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut tokens = Vec::new();

        let mut run_start = 0;
        let mut run_is_cjk: Option<bool> = None;

        for (idx, ch) in lowered.char_indices() {
            let cjk = is_cjk(ch);
            match run_is_cjk {
                Some(prev) if prev != cjk => {
                    push_run(&lowered[run_start..idx], prev, &mut tokens);
                    run_start = idx;
                    run_is_cjk = Some(cjk);
                }
                None => run_is_cjk = Some(cjk),
                _ => {}
            }
        }

        if let Some(prev) = run_is_cjk {
            push_run(&lowered[run_start..], prev, &mut tokens);
        }

        tokens
    }

    /// Query terms: segmented, stop words removed, de-duplicated in order
    pub fn keywords(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.segment(text)
            .into_iter()
            .filter(|token| !self.is_stop_word(token))
            .filter(|token| !is_particle_bigram(token))
            .filter(|token| seen.insert(token.clone()))
            .collect()
    }

    pub fn is_stop_word(&self, token: &str) -> bool {
        self.stop_words.contains(token)
    }
}

fn push_run(run: &str, cjk: bool, tokens: &mut Vec<String>) {
    if cjk {
        let chars: Vec<char> = run.chars().collect();
        if chars.len() == 1 {
            tokens.push(chars[0].to_string());
        } else {
            tokens.extend(chars.windows(2).map(|pair| pair.iter().collect::<String>()));
        }
    } else {
        tokens.extend(run.unicode_words().map(str::to_string));
    }
}

fn is_particle_bigram(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(a), Some(b), None) if is_cjk(a) && is_cjk(b) => {
            CJK_PARTICLES.contains(&a) || CJK_PARTICLES.contains(&b)
        }
        _ => false,
    }
}

/// CJK ideographs and Japanese kana
pub fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}'
        | '\u{3040}'..='\u{30FF}')
}

/// Edit distance allowed for a term, following Elasticsearch `fuzziness: AUTO`
pub fn auto_fuzziness(term: &str) -> u8 {
    if term.chars().any(is_cjk) {
        return 0;
    }
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}
