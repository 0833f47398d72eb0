/// A repository (archive, library, private collection) holding sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Repository {
    pub id: String,
    pub tree: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub notes: Option<String>,
}

/// A documentary source cited by citations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Source {
    pub id: String,
    pub tree: String,
    pub title: String,
    pub short_title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub call_number: Option<String>,
    pub repository_id: Option<String>,
    pub actual_text: Option<String>,
    pub comments: Option<String>,
}

/// A place; `name` is hierarchical, most specific component first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Place {
    pub id: String,
    pub tree: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zoom: Option<i64>,
    pub place_level: Option<i64>,
    pub notes: Option<String>,
}

/// Links a person, family or event to a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Citation {
    pub id: i64,
    pub tree: String,
    pub source_id: String,
    pub person_family_id: Option<String>,
    pub event_id: Option<i64>,
    pub page: Option<String>,
    pub quality: Option<i64>,
    pub cite_date: Option<String>,
    pub cite_text: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub id: i64,
    pub tree: String,
    pub person_family_id: Option<String>,
    pub event_type: String,
    pub event_date: Option<String>,
    pub place_id: Option<String>,
    pub info: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaLink {
    pub id: i64,
    pub tree: String,
    pub media_id: String,
    pub place_id: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Person {
    pub id: String,
    pub tree: String,
    pub name: String,
    pub birth_place_id: Option<String>,
    pub death_place_id: Option<String>,
}
