//! Recipient selector carried in the `to` field of routed messages.
//!
//! Grammar:
//!
//! - `""` selects nobody.
//! - `A`, `T`, `S`, `D` joined by `|` select groups. `A` absorbs the rest.
//! - `id1,id2` selects individuals.
//! - `T|S@id1,id2` selects groups plus individuals.
//! - Anything else is a single individual id.

use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    All,
    Teachers,
    Students,
    Devices,
}

impl Group {
    fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "A" => Some(Self::All),
            "T" => Some(Self::Teachers),
            "S" => Some(Self::Students),
            "D" => Some(Self::Devices),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecipientSelector {
    pub groups: BTreeSet<Group>,
    pub individuals: Vec<String>,
}

impl RecipientSelector {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }

        if let Some((groups, ids)) = raw.split_once('@') {
            if let Some(groups) = parse_groups(groups) {
                return Self {
                    groups,
                    individuals: parse_individuals(ids),
                };
            }
            return Self::single(raw);
        }

        if let Some(groups) = parse_groups(raw) {
            return Self {
                groups,
                individuals: Vec::new(),
            };
        }

        if raw.contains(',') {
            return Self {
                groups: BTreeSet::new(),
                individuals: parse_individuals(raw),
            };
        }

        Self::single(raw)
    }

    fn single(id: &str) -> Self {
        Self {
            groups: BTreeSet::new(),
            individuals: vec![id.to_string()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.individuals.is_empty()
    }

    pub fn includes(&self, group: Group) -> bool {
        self.groups.contains(&group)
    }
}

/// `None` unless every `|`-separated token is a group letter.
fn parse_groups(raw: &str) -> Option<BTreeSet<Group>> {
    let mut groups = BTreeSet::new();
    for token in raw.split('|') {
        groups.insert(Group::from_token(token)?);
    }
    if groups.contains(&Group::All) {
        groups.clear();
        groups.insert(Group::All);
    }
    Some(groups)
}

fn parse_individuals(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
