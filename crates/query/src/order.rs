use std::cmp::Ordering;

use serde_json::Value as Json;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    pub field: String,
    pub direction: Direction,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

fn type_rank(value: &Json) -> u8 {
    match value {
        Json::Number(_) => 0,
        Json::String(_) => 1,
        Json::Bool(_) => 2,
        _ => 3,
    }
}

/// Compare two JSON scalars per spec.md §4.5: native ordering on strings
/// (code-point) and numbers; for mixed types, numbers before strings before
/// booleans. Callers handle nulls separately (see [`compare_optional`]).
pub fn compare_json(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Number(a), Json::Number(b)) => a
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&b.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (Json::String(a), Json::String(b)) => a.cmp(b),
        (Json::Bool(a), Json::Bool(b)) => a.cmp(b),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare two optional field values honoring the null placement rule:
/// nulls last for ascending, first for descending.
pub fn compare_optional(a: Option<&Json>, b: Option<&Json>, direction: Direction) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => match direction {
            Direction::Asc => Ordering::Greater,
            Direction::Desc => Ordering::Less,
        },
        (Some(_), None) => match direction {
            Direction::Asc => Ordering::Less,
            Direction::Desc => Ordering::Greater,
        },
        (Some(a), Some(b)) => {
            let ord = compare_json(a, b);
            match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        }
    }
}

/// Stably sort `items` by `sort` (ties broken by each item's original
/// position, i.e. insertion order of ids, per spec.md §4.5), then truncate
/// to `limit`.
pub fn sort_and_limit<T>(
    mut items: Vec<T>,
    sort: Option<&Sort>,
    limit: Option<usize>,
    value_of: impl Fn(&T, &str) -> Option<Json>,
) -> Vec<T> {
    if let Some(sort) = sort {
        items.sort_by(|a, b| compare_optional(value_of(a, &sort.field).as_ref(), value_of(b, &sort.field).as_ref(), sort.direction));
    }
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}
