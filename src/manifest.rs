//! Firmware manifest listing the parts of each build.

use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::FlashPart;

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub builds: Vec<Build>,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Build {
    #[serde(default, rename = "chipFamily")]
    pub chip_family: Option<String>,
    pub parts: Vec<PartEntry>,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct PartEntry {
    pub path: String,
    pub offset: u32,
}

impl Manifest {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Build for `chip`, falling back to the first one when none names it
    pub fn build_for(&self, chip: &str) -> Option<&Build> {
        self.builds
            .iter()
            .find(|b| matches!(&b.chip_family, Some(f) if f.eq_ignore_ascii_case(chip)))
            .or_else(|| self.builds.first())
    }
}

impl Build {
    /// Load every part, paths relative to `base`
    pub fn load(&self, base: &Path) -> io::Result<Vec<FlashPart>> {
        self.parts
            .iter()
            .map(|p| Ok(FlashPart::new(p.offset, fs::read(base.join(&p.path))?)))
            .collect()
    }
}
