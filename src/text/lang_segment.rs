//! Per-character language run detection
//!
//! Splits a chunk of mixed-script text into runs of a single language so
//! each run can be cleaned and featurized with the right front-end. The
//! language-tag policy follows the original pipeline: Korean folds into
//! Chinese, CJK-ambiguous ideographs follow the user's tag, and the
//! `all_*` tags skip run splitting entirely.

use anyhow::{bail, Result};

/// Language of one text run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lang {
    Chinese,
    English,
    Japanese,
    Korean,
}

impl Lang {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lang::Chinese => "zh",
            Lang::English => "en",
            Lang::Japanese => "ja",
            Lang::Korean => "ko",
        }
    }
}

/// One single-language run of text.
#[derive(Debug, Clone)]
pub struct LangRun {
    pub text: String,
    pub lang: Lang,
}

/// Script class of a single character, before tag policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    /// Han ideographs, shared between Chinese and Japanese
    Han,
    /// Hiragana, katakana and their extensions
    Kana,
    /// Hangul
    Hangul,
    /// ASCII letters
    Latin,
    /// Digits, punctuation, whitespace: attaches to the surrounding run
    Neutral,
}

fn classify(c: char) -> CharClass {
    let code = c as u32;
    if c.is_ascii_alphabetic() {
        return CharClass::Latin;
    }
    // Hangul Jamo, Syllables, Compatibility Jamo, Jamo Extended-A/B
    if (0x1100..=0x11FF).contains(&code)
        || (0xAC00..=0xD7AF).contains(&code)
        || (0x3130..=0x318F).contains(&code)
        || (0xA960..=0xA97F).contains(&code)
        || (0xD7B0..=0xD7FF).contains(&code)
    {
        return CharClass::Hangul;
    }
    // Hiragana, katakana, phonetic extensions, half-width katakana
    if (0x3040..=0x309F).contains(&code)
        || (0x30A0..=0x30FF).contains(&code)
        || (0x31F0..=0x31FF).contains(&code)
        || (0xFF65..=0xFF9F).contains(&code)
    {
        return CharClass::Kana;
    }
    // CJK Unified Ideographs, Extensions A/B, compatibility, radicals
    if (0x4E00..=0x9FFF).contains(&code)
        || (0x3400..=0x4DBF).contains(&code)
        || (0x20000..=0x2A6DF).contains(&code)
        || (0xF900..=0xFAFF).contains(&code)
        || (0x2E80..=0x2EFF).contains(&code)
        || (0x2F00..=0x2FDF).contains(&code)
    {
        return CharClass::Han;
    }
    CharClass::Neutral
}

/// Resolve a script class to a language under the given tag.
fn resolve(class: CharClass, tag: &str) -> Option<Lang> {
    match class {
        CharClass::Latin => Some(Lang::English),
        // Korean folds into Chinese for every CJK tag
        CharClass::Hangul => Some(Lang::Chinese),
        CharClass::Kana => Some(Lang::Japanese),
        // Ambiguous ideographs follow the user's tag; `auto` reads them
        // as Chinese
        CharClass::Han => match tag {
            "ja" => Some(Lang::Japanese),
            _ => Some(Lang::Chinese),
        },
        CharClass::Neutral => None,
    }
}

/// Split a chunk into single-language runs under the given language tag.
///
/// Recognized tags: `auto`, `zh`, `ja`, `en`, `all_zh`, `all_ja`. Any
/// other tag fails before a model is ever touched.
pub fn split_language_runs(text: &str, tag: &str) -> Result<Vec<LangRun>> {
    match tag {
        "all_zh" => {
            return Ok(vec![LangRun {
                text: text.to_string(),
                lang: Lang::Chinese,
            }])
        }
        "all_ja" => {
            return Ok(vec![LangRun {
                text: text.to_string(),
                lang: Lang::Japanese,
            }])
        }
        "en" => {
            // English input is one run; collapse whitespace runs to single
            // spaces.
            let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
            return Ok(vec![LangRun {
                text: joined,
                lang: Lang::English,
            }]);
        }
        "auto" | "zh" | "ja" => {}
        other => bail!("unsupported language: {}", other),
    }

    let mut runs: Vec<LangRun> = Vec::new();
    let mut current = String::new();
    let mut current_lang: Option<Lang> = None;
    for c in text.chars() {
        match resolve(classify(c), tag) {
            Some(lang) => match current_lang {
                Some(prev) if prev == lang => current.push(c),
                Some(prev) => {
                    runs.push(LangRun {
                        text: std::mem::take(&mut current),
                        lang: prev,
                    });
                    current.push(c);
                    current_lang = Some(lang);
                }
                None => {
                    current.push(c);
                    current_lang = Some(lang);
                }
            },
            // Punctuation, digits and whitespace stay with the current run
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        runs.push(LangRun {
            text: current,
            lang: current_lang.unwrap_or(match tag {
                "ja" => Lang::Japanese,
                _ => Lang::Chinese,
            }),
        });
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_scripts() {
        assert_eq!(classify('a'), CharClass::Latin);
        assert_eq!(classify('你'), CharClass::Han);
        assert_eq!(classify('あ'), CharClass::Kana);
        assert_eq!(classify('한'), CharClass::Hangul);
        assert_eq!(classify('3'), CharClass::Neutral);
        assert_eq!(classify('。'), CharClass::Neutral);
    }

    #[test]
    fn test_pure_chinese_single_run() {
        let runs = split_language_runs("你好世界。", "zh").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "你好世界。");
        assert_eq!(runs[0].lang, Lang::Chinese);
    }

    #[test]
    fn test_mixed_chinese_english() {
        let runs = split_language_runs("你好Hello世界", "zh").unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].text, "你好");
        assert_eq!(runs[0].lang, Lang::Chinese);
        assert_eq!(runs[1].text, "Hello");
        assert_eq!(runs[1].lang, Lang::English);
        assert_eq!(runs[2].text, "世界");
        assert_eq!(runs[2].lang, Lang::Chinese);
    }

    #[test]
    fn test_punctuation_stays_with_run() {
        let runs = split_language_runs("你好，Hello!", "zh").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].text, "你好，");
        assert_eq!(runs[1].text, "Hello!");
    }

    #[test]
    fn test_korean_folds_into_chinese() {
        let runs = split_language_runs("안녕你好", "auto").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].lang, Lang::Chinese);
    }

    #[test]
    fn test_han_follows_ja_tag() {
        let runs = split_language_runs("日本語です", "ja").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].lang, Lang::Japanese);
    }

    #[test]
    fn test_en_tag_joins_and_collapses_spaces() {
        let runs = split_language_runs("hello   big  world", "en").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "hello big world");
        assert_eq!(runs[0].lang, Lang::English);
    }

    #[test]
    fn test_all_zh_skips_splitting() {
        let runs = split_language_runs("你好hello", "all_zh").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "你好hello");
        assert_eq!(runs[0].lang, Lang::Chinese);
    }

    #[test]
    fn test_unknown_tag_fails() {
        let err = split_language_runs("hello", "fr").unwrap_err();
        assert!(err.to_string().starts_with("unsupported language:"));
    }
}
