//! Component selectors.
//!
//! | selector  | matches                                   |
//! |-----------|-------------------------------------------|
//! | `*`       | every component                           |
//! | `#tag`    | components whose scope tags contain `tag` |
//! | `name`    | components whose id is exactly `name`     |
//!
//! Resolution walks regions, then hosts, then components in declaration
//! order, so the same selector against the same topology always yields the
//! same sequence. No match is an empty result, not an error.

use crate::error::{LabError, Result};
use crate::topology::{Component, HostRef, Region};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Tag(String),
    Id(String),
}

impl Selector {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "" | "#" => Err(LabError::InvalidSelector(s.to_string())),
            "*" => Ok(Selector::All),
            _ => match s.strip_prefix('#') {
                Some(tag) => Ok(Selector::Tag(tag.to_string())),
                None => Ok(Selector::Id(s.to_string())),
            },
        }
    }

    pub fn matches(&self, component: &Component) -> bool {
        match self {
            Selector::All => true,
            Selector::Tag(tag) => component.scope.has_tag(tag),
            Selector::Id(id) => component.id == *id,
        }
    }
}

impl FromStr for Selector {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => f.write_str("*"),
            Selector::Tag(tag) => write!(f, "#{tag}"),
            Selector::Id(id) => f.write_str(id),
        }
    }
}

/// One matched component together with the host that carries it.
#[derive(Debug, Clone, Copy)]
pub struct Selected<'a> {
    pub host: HostRef<'a>,
    pub component: &'a Component,
}

/// All matching (host, component) pairs in declaration order.
pub fn select<'a>(regions: &'a [Region], selector: &Selector) -> Vec<Selected<'a>> {
    let mut out = Vec::new();
    for region in regions {
        for host in &region.hosts {
            for component in &host.components {
                if selector.matches(component) {
                    out.push(Selected {
                        host: HostRef { region, host },
                        component,
                    });
                }
            }
        }
    }
    out
}

/// Distinct hosts carrying at least one match, in first-match order.
pub fn select_hosts<'a>(regions: &'a [Region], selector: &Selector) -> Vec<HostRef<'a>> {
    let mut seen = HashSet::new();
    select(regions, selector)
        .into_iter()
        .filter(|s| seen.insert(s.host.key()))
        .map(|s| s.host)
        .collect()
}
