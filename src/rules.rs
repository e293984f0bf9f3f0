use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A named bucket of regex patterns. The ad letter variants (`ada`..`adz`)
/// are sub-buckets of the ad signal the classifier scans one by one.
///
/// Categories are a closed enum mapped to their pattern stores through a
/// fixed table; category names never reach any dynamic lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleCategory {
    Ban,
    Ad,
    AdVariant(u8),
    Con,
    Aff,
    Iml,
    Pho,
    Del,
    Nm,
    Bio,
}

impl RuleCategory {
    /// Every category with its own persisted object, ad variants included.
    pub fn all() -> Vec<RuleCategory> {
        let mut all = vec![
            RuleCategory::Ban,
            RuleCategory::Ad,
            RuleCategory::Con,
            RuleCategory::Aff,
            RuleCategory::Iml,
            RuleCategory::Pho,
            RuleCategory::Del,
            RuleCategory::Nm,
            RuleCategory::Bio,
        ];
        all.extend(Self::ad_variants());
        all
    }

    pub fn ad_variants() -> impl Iterator<Item = RuleCategory> {
        (b'a'..=b'z').map(RuleCategory::AdVariant)
    }

    pub fn name(&self) -> String {
        match self {
            RuleCategory::Ban => "ban".to_string(),
            RuleCategory::Ad => "ad".to_string(),
            RuleCategory::AdVariant(letter) => format!("ad{}", *letter as char),
            RuleCategory::Con => "con".to_string(),
            RuleCategory::Aff => "aff".to_string(),
            RuleCategory::Iml => "iml".to_string(),
            RuleCategory::Pho => "pho".to_string(),
            RuleCategory::Del => "del".to_string(),
            RuleCategory::Nm => "nm".to_string(),
            RuleCategory::Bio => "bio".to_string(),
        }
    }

    /// Name of the persisted object holding this category's telemetry.
    pub fn object_name(&self) -> String {
        format!("{}_words", self.name())
    }

    pub fn parse(name: &str) -> Option<RuleCategory> {
        match name {
            "ban" => Some(RuleCategory::Ban),
            "ad" => Some(RuleCategory::Ad),
            "con" => Some(RuleCategory::Con),
            "aff" => Some(RuleCategory::Aff),
            "iml" => Some(RuleCategory::Iml),
            "pho" => Some(RuleCategory::Pho),
            "del" => Some(RuleCategory::Del),
            "nm" => Some(RuleCategory::Nm),
            "bio" => Some(RuleCategory::Bio),
            _ => {
                let mut chars = name.chars();
                if chars.next() == Some('a') && chars.next() == Some('d') {
                    match (chars.next(), chars.next()) {
                        (Some(letter @ 'a'..='z'), None) => {
                            Some(RuleCategory::AdVariant(letter as u8))
                        }
                        _ => None,
                    }
                } else {
                    None
                }
            }
        }
    }

    /// Parses a persisted object name such as `ban_words`.
    pub fn parse_object_name(name: &str) -> Option<RuleCategory> {
        name.strip_suffix("_words").and_then(Self::parse)
    }
}

/// One pattern's telemetry. Hit counts only ever go up between resets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub hits: u64,
    /// Skip this pattern for OCR-derived text; such patterns are too noisy
    /// against recognition artifacts.
    #[serde(default)]
    pub skip_ocr: bool,
}

/// Pattern table for every category, with hit telemetry and a compiled-regex
/// cache. Guarded by its own lock, separate from the processing domains,
/// since the classifier reads it concurrently with broadcast ruleset updates.
#[derive(Default)]
pub struct RuleStore {
    categories: HashMap<RuleCategory, BTreeMap<String, PatternEntry>>,
    compiled: HashMap<String, Regex>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(pattern: &str) -> Result<Regex> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .multi_line(true)
            .build()
            .with_context(|| format!("Invalid rule pattern: {pattern}"))
    }

    pub fn insert(&mut self, category: RuleCategory, pattern: &str, skip_ocr: bool) -> Result<()> {
        let regex = Self::compile(pattern)?;
        self.compiled.insert(pattern.to_string(), regex);
        self.categories.entry(category).or_default().insert(
            pattern.to_string(),
            PatternEntry {
                hits: 0,
                skip_ocr,
            },
        );
        Ok(())
    }

    /// Replaces a whole category, as delivered by a ruleset broadcast.
    /// Hit counts restart at zero for the new table. Patterns that fail to
    /// compile are dropped with a warning rather than poisoning the update.
    pub fn replace(&mut self, category: RuleCategory, patterns: BTreeMap<String, PatternEntry>) {
        let mut table = BTreeMap::new();
        for (pattern, entry) in patterns {
            match Self::compile(&pattern) {
                Ok(regex) => {
                    self.compiled.insert(pattern.clone(), regex);
                    table.insert(
                        pattern,
                        PatternEntry {
                            hits: 0,
                            skip_ocr: entry.skip_ocr,
                        },
                    );
                }
                Err(e) => log::warn!("Skipping pattern in {} update: {e:#}", category.name()),
            }
        }
        self.categories.insert(category, table);
    }

    /// Loads a persisted category table, keeping its stored hit counts.
    pub fn load(&mut self, category: RuleCategory, patterns: BTreeMap<String, PatternEntry>) {
        let mut table = BTreeMap::new();
        for (pattern, entry) in patterns {
            match Self::compile(&pattern) {
                Ok(regex) => {
                    self.compiled.insert(pattern.clone(), regex);
                    table.insert(pattern, entry);
                }
                Err(e) => log::warn!("Skipping stored pattern in {}: {e:#}", category.name()),
            }
        }
        self.categories.insert(category, table);
    }

    pub fn is_empty(&self, category: RuleCategory) -> bool {
        self.categories
            .get(&category)
            .map(|table| table.is_empty())
            .unwrap_or(true)
    }

    /// Patterns in a stable (lexicographic) order, paired with their entries.
    pub fn patterns(&self, category: RuleCategory) -> Vec<(String, PatternEntry)> {
        self.categories
            .get(&category)
            .map(|table| {
                table
                    .iter()
                    .map(|(pattern, entry)| (pattern.clone(), entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn regex(&self, pattern: &str) -> Option<&Regex> {
        self.compiled.get(pattern)
    }

    pub fn record_hit(&mut self, category: RuleCategory, pattern: &str) -> u64 {
        let Some(entry) = self
            .categories
            .get_mut(&category)
            .and_then(|table| table.get_mut(pattern))
        else {
            return 0;
        };
        entry.hits += 1;
        entry.hits
    }

    /// Snapshot of a category for persistence or a count share.
    pub fn snapshot(&self, category: RuleCategory) -> BTreeMap<String, PatternEntry> {
        self.categories.get(&category).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names_round_trip() {
        for category in RuleCategory::all() {
            assert_eq!(RuleCategory::parse(&category.name()), Some(category));
            assert_eq!(
                RuleCategory::parse_object_name(&category.object_name()),
                Some(category)
            );
        }
        assert_eq!(RuleCategory::parse("adx"), Some(RuleCategory::AdVariant(b'x')));
        assert_eq!(RuleCategory::parse("advert"), None);
        assert_eq!(RuleCategory::parse("xyz"), None);
    }

    #[test]
    fn test_record_hit_increments() {
        let mut store = RuleStore::new();
        store.insert(RuleCategory::Ban, "x", false).unwrap();
        assert_eq!(store.record_hit(RuleCategory::Ban, "x"), 1);
        assert_eq!(store.record_hit(RuleCategory::Ban, "x"), 2);
        assert_eq!(store.record_hit(RuleCategory::Ban, "missing"), 0);
    }

    #[test]
    fn test_replace_resets_hits_and_drops_bad_patterns() {
        let mut store = RuleStore::new();
        store.insert(RuleCategory::Ad, "old", false).unwrap();
        store.record_hit(RuleCategory::Ad, "old");

        let mut update = BTreeMap::new();
        update.insert(
            "fresh".to_string(),
            PatternEntry {
                hits: 9,
                skip_ocr: true,
            },
        );
        update.insert("(broken".to_string(), PatternEntry::default());
        store.replace(RuleCategory::Ad, update);

        let patterns = store.patterns(RuleCategory::Ad);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].0, "fresh");
        assert_eq!(patterns[0].1.hits, 0);
        assert!(patterns[0].1.skip_ocr);
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let mut store = RuleStore::new();
        store.insert(RuleCategory::Nm, "spammer", false).unwrap();
        let regex = store.regex("spammer").unwrap();
        assert!(regex.is_match("SPAMMER bot"));
    }
}
