//! Play selection by tag

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ProvisionError;

/// A group of steps that can be run on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    Windows,
    Linux,
    BuildArtifacts,
}

impl Tag {
    pub const ALL: [Tag; 3] = [Tag::Windows, Tag::Linux, Tag::BuildArtifacts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Windows => "windows",
            Tag::Linux => "linux",
            Tag::BuildArtifacts => "build_artifacts",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "windows" => Ok(Tag::Windows),
            "linux" => Ok(Tag::Linux),
            "build_artifacts" => Ok(Tag::BuildArtifacts),
            _ => Err(ProvisionError::UnknownTag(s.to_string())),
        }
    }
}

/// Which tags a run includes; an empty selection runs everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSelection {
    tags: BTreeSet<Tag>,
}

impl TagSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }

    /// Parse a comma separated list such as `windows,build_artifacts`
    pub fn parse(list: &str) -> Result<Self, ProvisionError> {
        let tags = list
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(Tag::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { tags })
    }

    pub fn includes(&self, tag: Tag) -> bool {
        self.tags.is_empty() || self.tags.contains(&tag)
    }

    /// Tags that will run, in play order
    pub fn selected(&self) -> Vec<Tag> {
        Tag::ALL.into_iter().filter(|t| self.includes(*t)).collect()
    }
}

impl fmt::Display for TagSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.selected().iter().map(Tag::as_str).collect();
        write!(f, "{}", names.join(","))
    }
}
