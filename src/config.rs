use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::zero_fill;
use crate::error::BidsError;

pub const SETTINGS_FILE_NAME: &str = "bids-rawdata.json";
pub const DEFAULT_CONVERTER: &str = "dcm2niix";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

const DEFAULT_DOMAIN: &str = "DATA";
const DEFAULT_BODY_PART: &str = "BRAIN";
const DEFAULT_CATEGORY: &str = "IMAGE";

#[derive(Debug, Deserialize, Serialize)]
pub struct SettingsConfig {
    pub working_dir: Utf8PathBuf,
    #[serde(default)]
    pub upload_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub dicom_modality_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub parrec_modality_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub suffix_map: Option<Utf8PathBuf>,
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,
}

/// Installation-wide settings, fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub working_dir: Utf8PathBuf,
    pub upload_dir: Option<Utf8PathBuf>,
    pub dicom_modality_dir: Utf8PathBuf,
    pub parrec_modality_dir: Utf8PathBuf,
    pub suffix_map: Utf8PathBuf,
    pub converter: String,
    pub lock_timeout: Duration,
}

pub struct SettingsLoader;

impl SettingsLoader {
    /// Reads the settings from `path`, or from `bids-rawdata.json` in the
    /// current directory, or from the user config directory.
    pub fn resolve(path: Option<&Path>) -> Result<Settings, BidsError> {
        let settings_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::discover().ok_or(BidsError::MissingSettings)?,
        };
        let content = fs::read_to_string(&settings_path)
            .map_err(|_| BidsError::ConfigRead(settings_path.clone()))?;
        let config: SettingsConfig = serde_json::from_str(&content)
            .map_err(|err| BidsError::ConfigParse(err.to_string()))?;
        Ok(Self::resolve_config(config))
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(SETTINGS_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "bids-rawdata")
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE_NAME))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: SettingsConfig) -> Settings {
        let working_dir = config.working_dir;
        Settings {
            dicom_modality_dir: config
                .dicom_modality_dir
                .unwrap_or_else(|| working_dir.join("modality").join("dicom")),
            parrec_modality_dir: config
                .parrec_modality_dir
                .unwrap_or_else(|| working_dir.join("modality").join("parrec")),
            suffix_map: config
                .suffix_map
                .unwrap_or_else(|| working_dir.join("suffix_map.json")),
            converter: config
                .converter
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONVERTER.to_string()),
            lock_timeout: Duration::from_secs(
                config.lock_timeout_secs.unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            ),
            upload_dir: config.upload_dir,
            working_dir,
        }
    }
}

/// A job value that may arrive as a JSON string or number.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(value) => write!(f, "{}", value.trim()),
            Scalar::Number(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(default)]
    pub user: Option<Scalar>,
    #[serde(default)]
    pub system_id: Option<Scalar>,
    #[serde(default)]
    pub project_code: Option<Scalar>,
    #[serde(default)]
    pub project_seq: Option<Scalar>,
    #[serde(default)]
    pub org_id: Option<Scalar>,
    #[serde(default)]
    pub trial_index: Option<Scalar>,
    #[serde(default)]
    pub upload_time: Option<Scalar>,
    #[serde(default)]
    pub subject_id: Option<Scalar>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub body_part: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub task: Option<TaskConfig>,
    #[serde(default)]
    pub flag: Option<Vec<FlagConfig>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default)]
    pub is_func: Option<bool>,
    #[serde(default)]
    pub option: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FlagConfig {
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskOption {
    pub is_func: bool,
    pub option: String,
}

/// Post-processing switch carried through from the job file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlagEntry {
    pub process: String,
    pub enabled: bool,
    pub options: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedJob {
    pub user: String,
    pub system_id: String,
    pub project_code: String,
    pub project_seq: String,
    pub org_id: String,
    pub trial_index: String,
    pub upload_time: String,
    pub subject_id: String,
    pub domain: String,
    pub body_part: String,
    pub category: String,
    pub public: bool,
    pub task: TaskOption,
    pub flags: Vec<FlagEntry>,
}

impl ResolvedJob {
    /// `{1|2}{projectCode}{projectSeq}{orgId}{subjectId}`, `1` for public
    /// projects.
    pub fn alias(&self) -> String {
        let visibility = if self.public { "1" } else { "2" };
        format!(
            "{visibility}{}{}{}{}",
            self.project_code, self.project_seq, self.org_id, self.subject_id
        )
    }

    pub fn session(&self) -> String {
        zero_fill(&self.trial_index)
    }

    /// Common prefix of the project's modality rule-table file names.
    pub fn rule_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.system_id, self.project_code, self.project_seq, self.org_id
        )
    }
}

pub struct JobLoader;

impl JobLoader {
    pub fn load(path: &Path) -> Result<ResolvedJob, BidsError> {
        let content =
            fs::read_to_string(path).map_err(|_| BidsError::ConfigRead(path.to_path_buf()))?;
        let value: Value =
            serde_json::from_str(&content).map_err(|err| BidsError::ConfigParse(err.to_string()))?;
        Self::resolve_value(value)
    }

    pub fn resolve_value(value: Value) -> Result<ResolvedJob, BidsError> {
        let config: JobConfig =
            serde_json::from_value(value).map_err(|err| BidsError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: JobConfig) -> Result<ResolvedJob, BidsError> {
        let mut missing = Vec::new();
        let mut required = |name: &str, value: Option<Scalar>| {
            let value = value.map(|value| value.to_string()).unwrap_or_default();
            if value.is_empty() {
                missing.push(name.to_string());
            }
            value
        };
        let user = required("user", config.user);
        let system_id = required("systemId", config.system_id);
        let project_code = required("projectCode", config.project_code);
        let project_seq = required("projectSeq", config.project_seq);
        let org_id = required("orgId", config.org_id);
        let trial_index = required("trialIndex", config.trial_index);
        let upload_time = required("uploadTime", config.upload_time);
        let subject_id = required("subjectId", config.subject_id);
        if !missing.is_empty() {
            return Err(BidsError::MissingJobFields(missing));
        }

        let task = config.task.unwrap_or_default();
        let flags = config
            .flag
            .unwrap_or_default()
            .into_iter()
            .map(|flag| FlagEntry {
                process: flag.process.unwrap_or_default(),
                enabled: flag.enabled.unwrap_or(false),
                options: match flag.options {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                },
            })
            .collect();

        Ok(ResolvedJob {
            user,
            system_id,
            project_code,
            project_seq,
            org_id,
            trial_index,
            upload_time,
            subject_id,
            domain: or_default(config.domain, DEFAULT_DOMAIN),
            body_part: or_default(config.body_part, DEFAULT_BODY_PART),
            category: or_default(config.category, DEFAULT_CATEGORY),
            public: config.public.unwrap_or(false),
            task: TaskOption {
                is_func: task.is_func.unwrap_or(false),
                option: task.option.unwrap_or_default().trim().to_string(),
            },
            flags,
        })
    }
}

fn or_default(value: Option<String>, default: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn minimal_job() -> Value {
        json!({
            "user": "alice",
            "systemId": "SYS",
            "projectCode": "PRJ",
            "projectSeq": 3,
            "orgId": "ORG",
            "trialIndex": "1",
            "uploadTime": "20240101120000",
            "subjectId": "007"
        })
    }

    #[test]
    fn defaults_are_applied() {
        let job = JobLoader::resolve_value(minimal_job()).unwrap();
        assert_eq!(job.domain, "DATA");
        assert_eq!(job.body_part, "BRAIN");
        assert_eq!(job.category, "IMAGE");
        assert!(!job.public);
        assert_eq!(job.task, TaskOption::default());
        assert!(job.flags.is_empty());
        assert_eq!(job.project_seq, "3");
        assert_eq!(job.alias(), "2PRJ3ORG007");
        assert_eq!(job.session(), "01");
        assert_eq!(job.rule_stem(), "SYS_PRJ_3_ORG");
    }

    #[test]
    fn empty_optionals_take_defaults() {
        let mut value = minimal_job();
        value["bodyPart"] = json!("");
        value["category"] = Value::Null;
        value["public"] = json!(true);
        value["flag"] = json!([{ "process": "thumbnail" }]);
        let job = JobLoader::resolve_value(value).unwrap();
        assert_eq!(job.body_part, "BRAIN");
        assert_eq!(job.category, "IMAGE");
        assert_eq!(job.alias(), "1PRJ3ORG007");
        assert_eq!(
            job.flags,
            vec![FlagEntry {
                process: "thumbnail".to_string(),
                enabled: false,
                options: String::new(),
            }]
        );
        assert!(job.flags.iter().all(|flag| !flag.enabled));
    }

    #[test]
    fn missing_fields_are_reported_together() {
        let err = JobLoader::resolve_value(json!({ "user": "alice", "projectSeq": 1 }));
        assert_matches!(err, Err(BidsError::MissingJobFields(fields)) => {
            assert_eq!(
                fields,
                vec!["systemId", "projectCode", "orgId", "trialIndex", "uploadTime", "subjectId"]
            );
        });
    }

    #[test]
    fn settings_defaults() {
        let config: SettingsConfig =
            serde_json::from_value(json!({ "working_dir": "/data" })).unwrap();
        let settings = SettingsLoader::resolve_config(config);
        assert_eq!(settings.converter, DEFAULT_CONVERTER);
        assert_eq!(settings.lock_timeout, Duration::from_secs(300));
        assert_eq!(settings.suffix_map, Utf8PathBuf::from("/data/suffix_map.json"));
        assert!(settings.upload_dir.is_none());
    }
}
