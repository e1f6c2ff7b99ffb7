//! Rating filter compilation
//!
//! Turns a rule's four rating lists into the content-rating filter expressions
//! understood by the remote account API. Every apply path goes through
//! [`compile`], so normalization and cross-library propagation live only here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rating shared by the movie and TV libraries
const CROSS_LIBRARY_RATING: &str = "TV-MA";

/// Spellings of the unrated tag used by the remote service
const UNRATED_SPELLINGS: [&str; 2] = ["NR", "Not Rated"];

/// The four rating lists of a rule, each a comma-separated string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingPolicy {
    pub movie_allowed: String,
    pub movie_blocked: String,
    pub tv_allowed: String,
    pub tv_blocked: String,
}

impl RatingPolicy {
    /// Compile this policy into per-library filters
    #[must_use]
    pub fn compile(&self) -> CompiledFilters {
        compile(
            &self.movie_allowed,
            &self.movie_blocked,
            &self.tv_allowed,
            &self.tv_blocked,
        )
    }

    /// Human-readable summary of the compiled filters, used in activity entries
    #[must_use]
    pub fn describe(&self) -> String {
        let filters = self.compile();
        let parts: Vec<String> = [("Movies", &filters.movie), ("TV", &filters.tv)]
            .into_iter()
            .filter_map(|(library, expr)| match expr {
                FilterExpr::Unrestricted => None,
                FilterExpr::Allow(ratings) => {
                    Some(format!("{library} allowed: {}", ratings.join(",")))
                }
                FilterExpr::Block(ratings) => {
                    Some(format!("{library} blocked: {}", ratings.join(",")))
                }
            })
            .collect();

        if parts.is_empty() {
            "No ratings configured".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

/// Filter expression for a single library
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FilterExpr {
    /// No restriction, omitted from the remote call
    #[default]
    Unrestricted,
    /// Only these ratings are visible
    Allow(Vec<String>),
    /// These ratings are hidden
    Block(Vec<String>),
}

impl FilterExpr {
    #[must_use]
    pub const fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => Ok(()),
            Self::Allow(ratings) => write!(f, "contentRating={}", ratings.join(",")),
            Self::Block(ratings) => write!(f, "contentRating!={}", ratings.join(",")),
        }
    }
}

/// Movie and TV filters produced for one rule
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledFilters {
    pub movie: FilterExpr,
    pub tv: FilterExpr,
}

impl CompiledFilters {
    /// True when neither library would be restricted
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.movie.is_unrestricted() && self.tv.is_unrestricted()
    }
}

/// Ordered, de-duplicated set of rating tokens
///
/// Keeps first-seen order so compiled filters are stable for a given input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RatingSet(Vec<String>);

impl RatingSet {
    fn parse(list: &str) -> Self {
        let mut set = Self::default();
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if UNRATED_SPELLINGS.contains(&token) {
                for spelling in UNRATED_SPELLINGS {
                    set.insert(spelling);
                }
            } else {
                set.insert(token);
            }
        }
        set
    }

    fn insert(&mut self, rating: &str) {
        if !self.contains(rating) {
            self.0.push(rating.to_string());
        }
    }

    fn contains(&self, rating: &str) -> bool {
        self.0.iter().any(|r| r == rating)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Add the cross-library rating to both sets when either one carries it
fn propagate_cross_library(movie: &mut RatingSet, tv: &mut RatingSet) {
    if movie.contains(CROSS_LIBRARY_RATING) || tv.contains(CROSS_LIBRARY_RATING) {
        movie.insert(CROSS_LIBRARY_RATING);
        tv.insert(CROSS_LIBRARY_RATING);
    }
}

fn build_filter(allowed: RatingSet, blocked: RatingSet) -> FilterExpr {
    if !allowed.is_empty() {
        FilterExpr::Allow(allowed.0)
    } else if !blocked.is_empty() {
        FilterExpr::Block(blocked.0)
    } else {
        FilterExpr::Unrestricted
    }
}

/// Compile the four rating lists into movie and TV filter expressions
///
/// Allowed lists win over blocked lists within a library. `NR` and
/// `Not Rated` expand to both spellings, and `TV-MA` is mirrored across
/// libraries for the allowed and blocked sets independently.
#[must_use]
pub fn compile(
    movie_allowed: &str,
    movie_blocked: &str,
    tv_allowed: &str,
    tv_blocked: &str,
) -> CompiledFilters {
    let mut movie_allowed = RatingSet::parse(movie_allowed);
    let mut movie_blocked = RatingSet::parse(movie_blocked);
    let mut tv_allowed = RatingSet::parse(tv_allowed);
    let mut tv_blocked = RatingSet::parse(tv_blocked);

    propagate_cross_library(&mut movie_blocked, &mut tv_blocked);
    propagate_cross_library(&mut movie_allowed, &mut tv_allowed);

    CompiledFilters {
        movie: build_filter(movie_allowed, movie_blocked),
        tv: build_filter(tv_allowed, tv_blocked),
    }
}
