//! Duplicate detection for extracted recipes.
//!
//! Multi-page recipes and re-runs over the same book produce repeat
//! candidates. A candidate is a duplicate when its normalised title matches
//! an already-persisted recipe for the same cookbook AND the Jaccard
//! similarity of the two ingredient-name sets reaches the configured
//! threshold. Comparison is case- and diacritics-insensitive ("Crème
//! Brûlée" == "creme brulee").
//!
//! The check runs immediately before each insert so cross-page repeats
//! never reach storage; it is not retroactive beyond the cookbook's own set.

use crate::model::{Ingredient, Recipe, RecipeCandidate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

/// Fold a title to its comparison key: NFD-decompose, strip combining
/// marks, lowercase, collapse runs of non-alphanumerics to single spaces.
pub fn normalize_title(title: &str) -> String {
    let folded: String = title
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    NON_ALNUM.replace_all(&folded, " ").trim().to_string()
}

/// Normalised ingredient-name set for similarity comparison. Quantities and
/// units are ignored — "2 cups flour" and "250g flour" are the same
/// ingredient.
pub fn ingredient_set(ingredients: &[Ingredient]) -> BTreeSet<String> {
    ingredients
        .iter()
        .map(|i| normalize_title(&i.name))
        .filter(|n| !n.is_empty())
        .collect()
}

/// Jaccard similarity of two sets. Two empty sets are identical (1.0) —
/// a title match with no ingredients on either side is still a repeat.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// In-run index of the cookbook's recipes, seeded from the store at job
/// start (resume-safe) and extended on every accepted insert.
#[derive(Debug)]
pub struct DedupIndex {
    entries: Vec<(String, BTreeSet<String>)>,
    threshold: f64,
}

impl DedupIndex {
    pub fn new(threshold: f64) -> Self {
        Self {
            entries: Vec::new(),
            threshold,
        }
    }

    /// Seed from recipes already persisted for the cookbook.
    pub fn seed(&mut self, existing: &[Recipe]) {
        for recipe in existing {
            self.entries.push((
                normalize_title(&recipe.title),
                ingredient_set(&recipe.ingredients),
            ));
        }
    }

    /// Whether any seen recipe shares this normalised title. Used to fold
    /// continuation pages into the recipe they continue.
    pub fn contains_title(&self, title: &str) -> bool {
        let key = normalize_title(title);
        self.entries.iter().any(|(t, _)| *t == key)
    }

    /// Duplicate test: normalised titles equal and ingredient similarity at
    /// or above the threshold.
    pub fn is_duplicate(&self, candidate: &RecipeCandidate) -> bool {
        let title = normalize_title(&candidate.title);
        let ingredients = ingredient_set(&candidate.ingredients);
        self.entries
            .iter()
            .any(|(t, set)| *t == title && jaccard(set, &ingredients) >= self.threshold)
    }

    /// Record an accepted candidate so later pages compare against it.
    pub fn observe(&mut self, candidate: &RecipeCandidate) {
        self.entries.push((
            normalize_title(&candidate.title),
            ingredient_set(&candidate.ingredients),
        ));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ing(names: &[&str]) -> Vec<Ingredient> {
        names
            .iter()
            .map(|n| Ingredient {
                name: n.to_string(),
                quantity: None,
                unit: None,
            })
            .collect()
    }

    fn candidate(title: &str, ingredients: &[&str]) -> RecipeCandidate {
        RecipeCandidate {
            title: title.to_string(),
            ingredients: ing(ingredients),
            instructions: vec![],
            nutrition: None,
            dietary_flags: vec![],
            confidence: 0.9,
            continuation: false,
        }
    }

    #[test]
    fn normalize_strips_case_and_diacritics() {
        assert_eq!(normalize_title("Crème Brûlée"), "creme brulee");
        assert_eq!(normalize_title("  Beef -- Wellington! "), "beef wellington");
        assert_eq!(
            normalize_title("Sopa de Ajo (García)"),
            "sopa de ajo garcia"
        );
    }

    #[test]
    fn jaccard_bounds() {
        let a: BTreeSet<String> = ["flour", "egg", "milk"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let b: BTreeSet<String> = ["flour", "egg", "butter"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let sim = jaccard(&a, &b);
        assert!((sim - 0.5).abs() < 1e-9, "got {sim}");
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 1.0);
    }

    #[test]
    fn rejects_match_above_threshold() {
        let mut index = DedupIndex::new(0.6);
        index.observe(&candidate("Crème Brûlée", &["cream", "sugar", "eggs", "vanilla"]));

        // Same title modulo diacritics, 3-of-4 shared ingredients (J = 0.6).
        let dup = candidate("creme brulee", &["cream", "sugar", "eggs", "lavender"]);
        assert!(index.is_duplicate(&dup));
    }

    #[test]
    fn accepts_match_below_threshold() {
        let mut index = DedupIndex::new(0.6);
        index.observe(&candidate("Tomato Soup", &["tomato", "basil", "cream"]));

        // Same title but a substantially different ingredient set.
        let other = candidate("Tomato Soup", &["tomato", "coconut milk", "lemongrass", "chili"]);
        assert!(!index.is_duplicate(&other));
        // Different title never matches regardless of ingredients.
        let renamed = candidate("Roast Tomato Soup", &["tomato", "basil", "cream"]);
        assert!(!index.is_duplicate(&renamed));
    }

    #[test]
    fn title_only_match_with_empty_ingredients() {
        let mut index = DedupIndex::new(0.6);
        index.observe(&candidate("Index of Sauces", &[]));
        assert!(index.is_duplicate(&candidate("index of sauces", &[])));
        assert!(index.contains_title("INDEX OF SAUCES"));
    }
}
