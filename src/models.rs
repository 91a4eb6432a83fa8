use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConversionError;

/// One game in the master catalogue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GameEntry {
    pub title: String,
    pub detail_url: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub size_hint: Option<String>,
}

impl GameEntry {
    /// Catalogue listings that point straight at a file double as their own
    /// mirror.
    pub fn direct_mirror(&self) -> MirrorLink {
        MirrorLink {
            label: self.title.clone(),
            url: self.detail_url.clone(),
        }
    }
}

impl fmt::Display for GameEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        if let Some(region) = self.region.as_deref().filter(|value| !value.is_empty()) {
            write!(f, "  [{}]", region)?;
        }
        if let Some(size) = self.size_hint.as_deref().filter(|value| !value.is_empty()) {
            write!(f, "  ({})", size)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MirrorLink {
    pub label: String,
    pub url: String,
}

impl fmt::Display for MirrorLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  ->  {}", self.label, self.url)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversionFormat {
    /// Expanded folder of game content (exiso).
    Xex,
    /// Games-on-Demand container (iso2god).
    God,
}

impl ConversionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionFormat::Xex => "XEX",
            ConversionFormat::God => "GOD",
        }
    }
}

impl fmt::Display for ConversionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionFormat {
    type Err = ConversionError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "XEX" => Ok(ConversionFormat::Xex),
            "GOD" => Ok(ConversionFormat::God),
            _ => Err(ConversionError::UnknownFormat(value.to_string())),
        }
    }
}

/// Everything one pipeline run needs.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub mirror: MirrorLink,
    pub install_dir: PathBuf,
    pub format: ConversionFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_display_skips_missing_fields() {
        let mut entry = GameEntry {
            title: "Halo 3".to_string(),
            detail_url: "https://example.test/halo3.zip".to_string(),
            region: None,
            size_hint: None,
        };
        assert_eq!(entry.to_string(), "Halo 3");

        entry.region = Some("USA".to_string());
        entry.size_hint = Some("6.8 GiB".to_string());
        assert_eq!(entry.to_string(), "Halo 3  [USA]  (6.8 GiB)");
        assert_eq!(entry.direct_mirror().url, entry.detail_url);
    }

    #[test]
    fn format_parsing_is_case_insensitive_and_closed() {
        assert_eq!("xex".parse::<ConversionFormat>().unwrap(), ConversionFormat::Xex);
        assert_eq!(" GOD ".parse::<ConversionFormat>().unwrap(), ConversionFormat::God);
        assert!(matches!(
            "ISO".parse::<ConversionFormat>(),
            Err(ConversionError::UnknownFormat(value)) if value == "ISO"
        ));
    }
}
