//! Keyword-table pet type classification.

use std::path::Path;

use anyhow::{Context, Result};
use petcat_core::PetType;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct PetTypeRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<PetTypeRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PetTypeRule {
    pub pet_type: PetType,
    pub contains_any: Vec<String>,
}

/// Case-insensitive whole-word match over `name`, then `category`.
/// Rules are tried in order; the first hit wins. A keyword of several words
/// matches the same words in sequence.
#[derive(Debug, Clone)]
pub struct PetTypeClassifier {
    rules: Vec<PetTypeRule>,
    phrases: Vec<Vec<Vec<String>>>,
}

impl Default for PetTypeClassifier {
    fn default() -> Self {
        let rule = |pet_type, words: &[&str]| PetTypeRule {
            pet_type,
            contains_any: words.iter().map(|w| w.to_string()).collect(),
        };
        Self::new(vec![
            rule(
                PetType::Dog,
                &["cane", "cani", "cucciolo", "cuccioli", "canina", "canino", "dog", "puppy"],
            ),
            rule(
                PetType::Cat,
                &["gatto", "gatti", "gattino", "gattini", "felino", "felina", "cat", "kitten"],
            ),
            rule(
                PetType::SmallAnimal,
                &[
                    "roditore", "roditori", "coniglio", "conigli", "criceto", "criceti", "cavia",
                    "cavie", "furetto", "furetti", "cincillà", "piccoli animali",
                ],
            ),
        ])
    }
}

impl PetTypeClassifier {
    pub fn new(rules: Vec<PetTypeRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| PetTypeRule {
                pet_type: r.pet_type,
                contains_any: r.contains_any.iter().map(|w| w.to_lowercase()).collect(),
            })
            .collect::<Vec<_>>();
        let phrases = rules
            .iter()
            .map(|rule| rule.contains_any.iter().map(|keyword| words(keyword)).collect())
            .collect();
        Self { rules, phrases }
    }

    /// Loads `rules/pet_types.yaml`; the built-in table applies when absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("pet_types.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: PetTypeRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.rules))
    }

    pub fn rules(&self) -> &[PetTypeRule] {
        &self.rules
    }

    pub fn classify(&self, name: &str, category: Option<&str>) -> PetType {
        [Some(name), category]
            .into_iter()
            .flatten()
            .find_map(|text| self.match_text(&words(text)))
            .unwrap_or(PetType::Other)
    }

    fn match_text(&self, text: &[String]) -> Option<PetType> {
        self.rules
            .iter()
            .zip(&self.phrases)
            .find(|(_, phrases)| {
                phrases
                    .iter()
                    .any(|phrase| !phrase.is_empty() && text.windows(phrase.len()).any(|w| w == phrase.as_slice()))
            })
            .map(|(rule, _)| rule.pet_type)
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}
