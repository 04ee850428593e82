use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::domain::{SourceFormat, UNKNOWN_MODALITY};
use crate::error::BidsError;
use crate::formats::{HeaderMap, dicom, normalize_key, parrec};
use crate::fs_util::split_nifti_name;
use crate::manifest::Manifest;

/// Set directory → modality label, in set order.
pub type ModalityMap = IndexMap<PathBuf, String>;

/// One alternative of a modality: it matches when any of its keys carries
/// one of the accepted values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    pub accepts: Vec<(String, Vec<String>)>,
}

impl Rule {
    pub fn matches(&self, metadata: &HeaderMap) -> bool {
        self.accepts.iter().any(|(key, values)| {
            metadata
                .get(key)
                .is_some_and(|value| values.iter().any(|accepted| accepted == value))
        })
    }
}

/// Modality rules in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    modalities: Vec<(String, Vec<Rule>)>,
}

type RawRuleTable = IndexMap<String, Vec<IndexMap<String, Value>>>;

impl RuleTable {
    pub fn file_name(rule_stem: &str, format: SourceFormat) -> String {
        format!("{rule_stem}_{}_modality.json", format.rule_tag())
    }

    /// Loads `{dir}/{rule_stem}_{format}_modality.json`. A missing or
    /// malformed table yields an empty one, so every set maps to `unknown`.
    pub fn load(dir: &Path, rule_stem: &str, format: SourceFormat) -> Self {
        let path = dir.join(Self::file_name(rule_stem, format));
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                error!(path = %path.display(), error = %err, "modality rule table not readable");
                return Self::default();
            }
        };
        match Self::from_json(&content) {
            Ok(table) => {
                debug!(path = %path.display(), modalities = table.len(), "modality rules loaded");
                table
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "modality rule table malformed");
                Self::default()
            }
        }
    }

    pub fn from_json(content: &str) -> Result<Self, BidsError> {
        let raw: RawRuleTable =
            serde_json::from_str(content).map_err(|err| BidsError::ConfigParse(err.to_string()))?;
        let modalities = raw
            .into_iter()
            .map(|(modality, rules)| {
                let rules = rules
                    .into_iter()
                    .map(|rule| Rule {
                        accepts: rule
                            .into_iter()
                            .map(|(key, values)| (normalize_key(&key), accepted_values(values)))
                            .collect(),
                    })
                    .collect();
                (modality, rules)
            })
            .collect();
        Ok(Self { modalities })
    }

    /// First modality, in declaration order, with a matching rule.
    pub fn resolve(&self, metadata: &HeaderMap) -> &str {
        self.modalities
            .iter()
            .find(|(_, rules)| rules.iter().any(|rule| rule.matches(metadata)))
            .map(|(modality, _)| modality.as_str())
            .unwrap_or(UNKNOWN_MODALITY)
    }

    pub fn len(&self) -> usize {
        self.modalities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modalities.is_empty()
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn accepted_values(values: Value) -> Vec<String> {
    match values {
        Value::Array(items) => items.into_iter().map(stringify).collect(),
        scalar => vec![stringify(scalar)],
    }
}

/// Modality of a separated NIfTI name `…_{modality}_0001.nii[.gz]`.
pub fn modality_from_filename(name: &str) -> String {
    let (stem, _) = split_nifti_name(name);
    let parts = stem.split('_').collect::<Vec<_>>();
    if parts.len() < 4 {
        warn!(file = %name, "NIfTI name has too few tokens for a modality");
        return UNKNOWN_MODALITY.to_string();
    }
    if parts[parts.len() - 1] != "0001" {
        warn!(file = %name, "NIfTI name does not end in 0001");
        return UNKNOWN_MODALITY.to_string();
    }
    parts[parts.len() - 2].to_string()
}

#[derive(Debug, Clone)]
enum Strategy {
    Metadata(RuleTable),
    FilenameSuffix,
}

/// Resolves one modality label per separated set.
#[derive(Debug, Clone)]
pub struct ModalityMapper {
    format: SourceFormat,
    strategy: Strategy,
}

impl ModalityMapper {
    pub fn new(format: SourceFormat, rules: RuleTable) -> Self {
        let strategy = match format {
            SourceFormat::Dicom | SourceFormat::Parrec => Strategy::Metadata(rules),
            SourceFormat::Nifti => Strategy::FilenameSuffix,
        };
        Self { format, strategy }
    }

    /// Mapper for `format` with its rule table loaded from `rule_dir`.
    pub fn load(format: SourceFormat, rule_dir: &Path, rule_stem: &str) -> Self {
        let rules = match format {
            SourceFormat::Nifti => RuleTable::default(),
            _ => RuleTable::load(rule_dir, rule_stem, format),
        };
        Self::new(format, rules)
    }

    pub fn map_sets<P: AsRef<Path>>(&self, sets: &[P]) -> Result<ModalityMap, BidsError> {
        let mut mapping = ModalityMap::new();
        for set in sets {
            let set = set.as_ref();
            if let Some(modality) = self.resolve_set(set)? {
                info!(set = %set.display(), modality = %modality, "modality resolved");
                mapping.insert(set.to_path_buf(), modality);
            }
        }
        Ok(mapping)
    }

    /// `None` when the set has no candidate files.
    pub fn resolve_set(&self, dir: &Path) -> Result<Option<String>, BidsError> {
        let candidates = self.candidates(dir)?;
        if candidates.is_empty() {
            warn!(set = %dir.display(), format = %self.format, "no candidate files in set");
            return Ok(None);
        }
        let labels = candidates
            .iter()
            .map(|file| self.label(file))
            .collect::<BTreeSet<_>>();
        if labels.len() > 1 {
            return Err(BidsError::AmbiguousModality {
                set: dir.display().to_string(),
                modalities: labels.into_iter().collect(),
            });
        }
        Ok(labels.into_iter().next())
    }

    fn candidates(&self, dir: &Path) -> Result<Vec<PathBuf>, BidsError> {
        let files = Manifest::scan(dir, false)?
            .path
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| {
                let name = path
                    .file_name()
                    .map(|value| value.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                match self.format {
                    SourceFormat::Dicom => !name.ends_with(".json"),
                    SourceFormat::Parrec => name.ends_with(".par"),
                    SourceFormat::Nifti => name.ends_with(".nii") || name.ends_with(".nii.gz"),
                }
            })
            .collect();
        Ok(files)
    }

    fn label(&self, file: &Path) -> String {
        match &self.strategy {
            Strategy::FilenameSuffix => {
                modality_from_filename(&crate::fs_util::file_name(file))
            }
            Strategy::Metadata(rules) => {
                let metadata = match self.format {
                    SourceFormat::Parrec => parrec::read_metadata(file),
                    _ => dicom::read_metadata(file),
                };
                match metadata {
                    Ok(metadata) => rules.resolve(&metadata).to_string(),
                    Err(err) => {
                        error!(file = %file.display(), error = %err, "metadata unreadable");
                        UNKNOWN_MODALITY.to_string()
                    }
                }
            }
        }
    }
}
