/// Normalize a label for comparison: trim, lowercase, strip punctuation and
/// collapse whitespace. Apostrophes are dropped ("O'Brien" → "obrien"); other
/// punctuation separates words ("Smith-Jones" → "smith jones").
pub fn normalize_label(label: &str) -> String {
    let mapped: String = label
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a hierarchical place name on commas and normalize each component,
/// dropping empty ones. Most specific component first.
pub fn place_components(label: &str) -> Vec<String> {
    label
        .split(',')
        .map(normalize_label)
        .filter(|c| !c.is_empty())
        .collect()
}

pub fn tokens(normalized: &str) -> impl Iterator<Item = &str> {
    normalized.split_whitespace()
}
