use crate::config::EmojiConfig;
use crate::rules::{RuleCategory, RuleStore};
use crate::storage::ObjectStore;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref MULTI_WHITESPACE: Regex = Regex::new(r"\s{2,}").unwrap();
}

/// Collapses runs of two or more whitespace characters into one space.
pub fn normalize_text(text: &str) -> String {
    MULTI_WHITESPACE.replace_all(text, " ").into_owned()
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Which emoji-density thresholds to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmojiKind {
    Ad,
    Many,
    WatchBait,
}

/// Content classifier over the shared rule table. Stateless apart from the
/// hit telemetry it writes back through the store.
pub struct Classifier {
    rules: Arc<Mutex<RuleStore>>,
    store: ObjectStore,
    emoji: EmojiConfig,
}

impl Classifier {
    pub fn new(rules: Arc<Mutex<RuleStore>>, store: ObjectStore, emoji: EmojiConfig) -> Self {
        Classifier { rules, store, emoji }
    }

    /// Matches `text` against one rule category. The first pass collapses
    /// whitespace runs; if nothing matches and the text still contains
    /// whitespace, exactly one retry runs with all whitespace stripped.
    ///
    /// Only the first matching pattern's hit counter is incremented per
    /// call; the telemetry snapshot is persisted right after the bump.
    pub fn regex_match(&self, category: RuleCategory, text: &str, ocr: bool) -> Option<String> {
        if text.is_empty() {
            return None;
        }

        let mut current = normalize_text(text);
        for pass in 0..2 {
            if let Some(pattern) = self.match_once(category, &current, ocr) {
                return Some(pattern);
            }

            if pass == 0 {
                if !current.chars().any(char::is_whitespace) {
                    break;
                }
                current = strip_whitespace(&current);
            }
        }

        None
    }

    fn match_once(&self, category: RuleCategory, text: &str, ocr: bool) -> Option<String> {
        let mut rules = self.rules.lock().unwrap();
        for (pattern, entry) in rules.patterns(category) {
            if ocr && entry.skip_ocr {
                continue;
            }

            let matched = rules
                .regex(&pattern)
                .map(|regex| regex.is_match(text))
                .unwrap_or(false);
            if matched {
                rules.record_hit(category, &pattern);
                let snapshot = rules.snapshot(category);
                drop(rules);
                self.store.persist(&category.object_name(), &snapshot);
                return Some(pattern);
            }
        }
        None
    }

    /// Scans the ad letter variants and returns the first matching one,
    /// skipping a variant that already matched earlier in the same check.
    pub fn ad_variant(&self, text: &str, ocr: bool, matched: Option<u8>) -> Option<u8> {
        if text.is_empty() {
            return None;
        }

        (b'a'..=b'z')
            .filter(|letter| Some(*letter) != matched)
            .find(|letter| {
                self.regex_match(RuleCategory::AdVariant(*letter), text, ocr)
                    .is_some()
            })
    }

    /// Any contact/solicitation signal.
    pub fn is_con_text(&self, text: &str, ocr: bool) -> bool {
        [
            RuleCategory::Con,
            RuleCategory::Aff,
            RuleCategory::Iml,
            RuleCategory::Pho,
        ]
        .iter()
        .any(|category| self.regex_match(*category, text, ocr).is_some())
    }

    /// Ban-worthy text: a direct ban match, an ad signal (regex or emoji
    /// density) co-occurring with a contact signal, an ad letter variant
    /// co-occurring with a contact signal, or a second independent ad
    /// variant on its own.
    pub fn is_ban_text(&self, text: &str, ocr: bool) -> bool {
        if self.regex_match(RuleCategory::Ban, text, ocr).is_some() {
            return true;
        }

        let ad = self.regex_match(RuleCategory::Ad, text, ocr).is_some()
            || self.emoji_density(EmojiKind::Ad, text);
        let con = self.is_con_text(text, ocr);
        if ad && con {
            return true;
        }

        let variant = self.ad_variant(text, ocr, None);
        if variant.is_some() && con {
            return true;
        }

        // A repeated ad signal alone is sufficient even without contact info.
        if let Some(letter) = variant {
            return self.ad_variant(text, ocr, Some(letter)).is_some();
        }

        false
    }

    /// Known benign sender classification, applied to display and forward
    /// names and to normalized message text.
    pub fn is_nm_text(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }

        self.regex_match(RuleCategory::Nm, text, false).is_some()
            || self.regex_match(RuleCategory::Bio, text, false).is_some()
            || self.is_ban_text(text, false)
    }

    /// The supervisor bot's delete-without-punish category.
    pub fn is_delete_text(&self, text: &str) -> bool {
        self.regex_match(RuleCategory::Del, text, false).is_some()
    }

    /// Emoji-density heuristic. Builds the set of distinct configured emojis
    /// present in the text (protected ones excluded), drops any emoji that is
    /// a substring of another present emoji so composite glyphs are not
    /// double-counted, then applies the per-kind thresholds.
    pub fn emoji_density(&self, kind: EmojiKind, text: &str) -> bool {
        let present: Vec<&str> = self
            .emoji
            .set
            .iter()
            .filter(|e| !self.emoji.protect.contains(*e) && text.contains(e.as_str()))
            .map(|e| e.as_str())
            .collect();

        let survivors: Vec<&str> = present
            .iter()
            .copied()
            .filter(|e| !present.iter().any(|other| other != e && other.contains(e)))
            .collect();

        let counts: Vec<usize> = survivors
            .iter()
            .map(|e| text.matches(*e).count())
            .collect();
        let single = counts.iter().copied().max().unwrap_or(0);
        let total: usize = counts.iter().sum();

        match kind {
            EmojiKind::Ad => single >= self.emoji.ad_single || total >= self.emoji.ad_total,
            EmojiKind::Many => total >= self.emoji.many_total,
            EmojiKind::WatchBait => {
                single >= self.emoji.wb_single || total >= self.emoji.wb_total
            }
        }
    }
}
