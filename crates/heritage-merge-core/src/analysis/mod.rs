pub mod duplicates;
pub mod normalize;
pub mod similarity;

pub use duplicates::{find_duplicates, label_similarity, DuplicateCandidate, DuplicateScan, ReviewItem};
