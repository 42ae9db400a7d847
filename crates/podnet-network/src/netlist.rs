//! Selection of the networks a pod joins.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Networks selected for a pod, parsed from a comma separated list.
///
/// `"all"` or `"true"` select every configured network. An empty list
/// selects none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetList {
    names: BTreeSet<String>,
}

impl NetList {
    /// Select every configured network.
    #[must_use]
    pub fn everything() -> Self {
        Self::from_names(["all"])
    }

    /// Select the given networks.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .filter(|name: &String| !name.is_empty())
                .collect(),
        }
    }

    /// Add more comma separated entries.
    pub fn extend_from_str(&mut self, value: &str) {
        self.names.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        );
    }

    /// Whether any network is selected.
    #[must_use]
    pub fn any(&self) -> bool {
        !self.names.is_empty()
    }

    /// Whether every network is selected.
    #[must_use]
    pub fn all(&self) -> bool {
        self.names.contains("all") || self.names.contains("true")
    }

    /// Whether `name` is selected, either by name or through [`NetList::all`].
    #[must_use]
    pub fn specific(&self, name: &str) -> bool {
        self.all() || self.names.contains(name)
    }

    /// Explicitly listed network names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .map(String::as_str)
            .filter(|name| !matches!(*name, "all" | "true"))
    }
}

impl FromStr for NetList {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut list = Self::default();
        list.extend_from_str(s);
        Ok(list)
    }
}

impl fmt::Display for NetList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        f.write_str(&names.join(","))
    }
}
