//! Locale derivation for meeting prompts and reply sanitization (§4.7.1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    Ko,
    Ja,
    Zh,
    En,
}

impl Locale {
    pub fn as_str(self) -> &'static str {
        match self {
            Locale::Ko => "ko",
            Locale::Ja => "ja",
            Locale::Zh => "zh",
            Locale::En => "en",
        }
    }

    pub fn language_instruction(self) -> &'static str {
        match self {
            Locale::Ko => "Respond in Korean.",
            Locale::Ja => "Respond in Japanese.",
            Locale::Zh => "Respond in Chinese.",
            Locale::En => "Respond in English.",
        }
    }
}

impl std::str::FromStr for Locale {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ko" => Ok(Locale::Ko),
            "ja" => Ok(Locale::Ja),
            "zh" => Ok(Locale::Zh),
            "en" => Ok(Locale::En),
            _ => Err(()),
        }
    }
}

/// Derive a locale from `text` via Unicode-range character ratios:
/// Hangul > 15% → ko, Hiragana/Katakana > 15% → ja, Han > 30% → zh, else en.
pub fn detect_locale(text: &str) -> Locale {
    let total = text.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return Locale::En;
    }

    let mut hangul = 0usize;
    let mut kana = 0usize;
    let mut han = 0usize;

    for c in text.chars() {
        let cp = c as u32;
        if (0xAC00..=0xD7A3).contains(&cp) || (0x1100..=0x11FF).contains(&cp) {
            hangul += 1;
        } else if (0x3040..=0x30FF).contains(&cp) {
            kana += 1;
        } else if (0x4E00..=0x9FFF).contains(&cp) {
            han += 1;
        }
    }

    let ratio = |n: usize| n as f64 / total as f64;

    if ratio(hangul) > 0.15 {
        Locale::Ko
    } else if ratio(kana) > 0.15 {
        Locale::Ja
    } else if ratio(han) > 0.30 {
        Locale::Zh
    } else {
        Locale::En
    }
}

/// Resolve the effective locale for a task: the persisted `language`
/// setting overrides detection from the task text.
pub fn resolve_locale(task_text: &str, language_setting: Option<&str>) -> Locale {
    language_setting
        .and_then(|s| s.parse::<Locale>().ok())
        .unwrap_or_else(|| detect_locale(task_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_korean() {
        assert_eq!(
            detect_locale("디자인 시안과 QA 테스트 계획을 받아서 개발 배포 준비"),
            Locale::Ko
        );
    }

    #[test]
    fn detects_japanese() {
        assert_eq!(detect_locale("これはテストです、お願いします"), Locale::Ja);
    }

    #[test]
    fn detects_chinese() {
        assert_eq!(detect_locale("请把这个功能实现完整并且测试通过谢谢"), Locale::Zh);
    }

    #[test]
    fn defaults_to_english() {
        assert_eq!(detect_locale("Add a CHANGELOG.md with an initial entry"), Locale::En);
    }

    #[test]
    fn setting_overrides_detection() {
        assert_eq!(resolve_locale("hello world", Some("ko")), Locale::Ko);
    }
}
