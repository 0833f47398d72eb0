use strsim::normalized_levenshtein;

/// Components on either side of a place name count as agreeing at or above this ratio.
const COMPONENT_MATCH_RATIO: f64 = 0.85;
const LOCALITY_WEIGHT: f64 = 0.6;

/// Edit-distance ratio in [0, 1]; 1.0 for identical strings.
pub fn edit_ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

/// Score two hierarchical place names given as normalized components, most
/// specific first.
///
/// `0.6 × locality ratio + 0.4 × qualifier agreement`, where qualifier
/// agreement is the fraction of the shorter side's remaining components that
/// match some remaining component of the other side. A side without
/// qualifiers agrees with anything ("Boston" vs "Boston, Suffolk, Massachusetts").
pub fn place_similarity(a: &[String], b: &[String]) -> f64 {
    let (Some(locality_a), Some(locality_b)) = (a.first(), b.first()) else {
        return 0.0;
    };
    let locality = edit_ratio(locality_a, locality_b);

    let (short, long) = if a.len() <= b.len() {
        (&a[1..], &b[1..])
    } else {
        (&b[1..], &a[1..])
    };
    let qualifiers = if short.is_empty() {
        1.0
    } else {
        let agreeing = short
            .iter()
            .filter(|q| long.iter().any(|other| edit_ratio(q, other) >= COMPONENT_MATCH_RATIO))
            .count();
        agreeing as f64 / short.len() as f64
    };

    LOCALITY_WEIGHT * locality + (1.0 - LOCALITY_WEIGHT) * qualifiers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comps(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_edit_ratio_bounds() {
        assert_eq!(edit_ratio("smith bible", "smith bible"), 1.0);
        assert!(edit_ratio("smith bible", "jones ledger") < 0.5);
    }

    #[test]
    fn test_place_with_missing_qualifiers_matches() {
        let a = comps(&["boston"]);
        let b = comps(&["boston", "suffolk", "massachusetts"]);
        assert!((place_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_place_with_conflicting_qualifiers_is_penalized() {
        let a = comps(&["springfield", "illinois"]);
        let b = comps(&["springfield", "massachusetts"]);
        let score = place_similarity(&a, &b);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_place_spelling_variant() {
        let a = comps(&["philadelphia", "pennsylvania", "usa"]);
        let b = comps(&["philadelphia", "pensylvania", "usa"]);
        assert!(place_similarity(&a, &b) > 0.95);
    }

    #[test]
    fn test_place_similarity_is_symmetric() {
        let a = comps(&["st louis", "missouri"]);
        let b = comps(&["saint louis", "missouri", "usa"]);
        assert_eq!(place_similarity(&a, &b), place_similarity(&b, &a));
    }
}
