//! The line-oriented `.jhm`/`.jhm-cache` file format.
//!
//! ```text
//! # comment to end of line
//! key                 # a key with no value
//! key=value
//! +section-name       # opens a section; subsequent keys belong to it
//! ```
//!
//! Shared by [`crate::config`] (which layers parent-chained `.jhm` config
//! files) and [`crate::cache`] (which reuses the same grammar for
//! `.jhm-cache` files but never chains parents).

use indexmap::IndexMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::error::{BuildError, Result};

pub const ROOT_SECTION: &str = "";

/// One section's key/value pairs, insertion-ordered (an absent `=value`
/// is stored as `None`, matching the format's bare-`key` form).
pub type Section = IndexMap<String, Option<String>>;

#[derive(Debug, Clone, Default)]
pub struct RawFile {
    sections: IndexMap<String, Section>,
}

impl RawFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::Configuration(format!("config file {} does not exist", path.display()))
            } else {
                BuildError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        Self::parse_str(&text)
    }

    pub fn parse_str(text: &str) -> Result<Self> {
        let mut sections: IndexMap<String, Section> = IndexMap::new();
        sections.insert(ROOT_SECTION.to_string(), Section::new());
        let mut section = ROOT_SECTION.to_string();
        let mut seen_parent = false;

        for raw_line in text.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('+') {
                section = name.trim().to_string();
                sections.entry(section.clone()).or_default();
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (line.to_string(), None),
            };
            if section == ROOT_SECTION && key == "parent" {
                if seen_parent {
                    return Err(BuildError::Configuration(
                        "duplicate 'parent' directive in config file".to_string(),
                    ));
                }
                seen_parent = true;
            }
            sections.entry(section.clone()).or_default().insert(key, value);
        }

        Ok(Self { sections })
    }

    pub fn get(&self, key: &str, section: &str) -> Option<&Option<String>> {
        self.sections.get(section).and_then(|s| s.get(key))
    }

    pub fn section(&self, section: &str) -> Section {
        self.sections.get(section).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Option<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, kv) in &self.sections {
            if !name.is_empty() {
                let _ = writeln!(out, "+{name}");
            }
            for (k, v) in kv {
                match v {
                    Some(v) => {
                        let _ = writeln!(out, "{k}={v}");
                    }
                    None => {
                        let _ = writeln!(out, "{k}");
                    }
                }
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BuildError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        // Write-to-temp-then-rename so a concurrent reader never observes
        // a half-written cache file.
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BuildError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        use std::io::Write;
        tmp.write_all(self.render().as_bytes())
            .map_err(|e| BuildError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        tmp.persist(path).map_err(|e| BuildError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_comments() {
        let f = RawFile::parse_str(
            "# a comment\nparent=base.jhm\n\n+gcc-args\nk=v\nbare_key # trailing comment\n",
        )
        .unwrap();
        assert_eq!(
            f.get("parent", ROOT_SECTION),
            Some(&Some("base.jhm".to_string()))
        );
        assert_eq!(f.get("k", "gcc-args"), Some(&Some("v".to_string())));
        assert_eq!(f.get("bare_key", "gcc-args"), Some(&None));
    }

    #[test]
    fn round_trips_through_render() {
        let mut f = RawFile::new();
        f.set("requires", "/abs/path/a.h", None);
        f.set(ROOT_SECTION, "num_cores", Some("4".to_string()));
        let rendered = f.render();
        let reparsed = RawFile::parse_str(&rendered).unwrap();
        assert_eq!(reparsed.get("/abs/path/a.h", "requires"), Some(&None));
        assert_eq!(
            reparsed.get("num_cores", ROOT_SECTION),
            Some(&Some("4".to_string()))
        );
    }
}
