//! Drive selection sources.
//!
//! The core only needs two things per invocation: the resolved list of
//! drives to act on and, for parameter operations, the hierarchical
//! parameter tree. Both come through the [`DriveSource`] trait so the
//! calling layer can plug in whatever discovery it likes.
//!
//! [`YamlRegistry`] is the bundled implementation: a YAML drive file with
//! per-drive address and group membership, optionally filtered down to
//! drives matching every requested group:
//!
//! ```yaml
//! axis1:
//!   ip: 10.0.0.7
//!   groups: [arm, string1]
//! axis2:
//!   ip: 10.0.0.8
//!   port: 8023
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::DriveEndpoint;
use crate::error::{DriveError, DriveResult};
use crate::params::ParameterTree;

/// One selected drive: its endpoint plus the group membership the
/// parameter resolver needs.
#[derive(Clone, Debug)]
pub struct SelectedDrive {
    pub endpoint: DriveEndpoint,
    pub groups: Vec<String>,
}

/// Where a fleet invocation gets its drives and parameter tree from.
pub trait DriveSource: Send + Sync {
    /// Drives to act on, in declaration order.
    fn selected_drives(&self) -> DriveResult<Vec<SelectedDrive>>;

    /// The hierarchical parameter tree for parameter operations.
    fn parameter_tree(&self) -> DriveResult<ParameterTree>;
}

#[derive(Debug, Deserialize)]
struct DriveRecord {
    ip: String,
    port: Option<u16>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    trace: bool,
}

/// YAML-file-backed drive source with group filtering.
#[derive(Clone, Debug)]
pub struct YamlRegistry {
    drives_path: PathBuf,
    parameter_path: Option<PathBuf>,
    group_filter: Vec<String>,
}

impl YamlRegistry {
    pub fn new(drives_path: impl Into<PathBuf>) -> Self {
        Self {
            drives_path: drives_path.into(),
            parameter_path: None,
            group_filter: Vec::new(),
        }
    }

    /// Keep only drives that belong to every one of `groups`.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.group_filter = groups;
        self
    }

    pub fn with_parameter_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.parameter_path = Some(path.into());
        self
    }
}

impl DriveSource for YamlRegistry {
    fn selected_drives(&self) -> DriveResult<Vec<SelectedDrive>> {
        let text = std::fs::read_to_string(&self.drives_path)?;
        parse_drives_file(&text, &self.group_filter)
    }

    fn parameter_tree(&self) -> DriveResult<ParameterTree> {
        let path = self.parameter_path.as_deref().ok_or_else(|| {
            DriveError::Parameter("no parameter file configured for this registry".into())
        })?;
        load_parameter_file(path)
    }
}

/// A fixed, caller-supplied drive list (the "act on these addresses"
/// path). Carries no group membership and no parameter tree.
#[derive(Clone, Debug)]
pub struct ExplicitDrives {
    pub endpoints: Vec<DriveEndpoint>,
}

impl DriveSource for ExplicitDrives {
    fn selected_drives(&self) -> DriveResult<Vec<SelectedDrive>> {
        Ok(self
            .endpoints
            .iter()
            .cloned()
            .map(|endpoint| SelectedDrive {
                endpoint,
                groups: Vec::new(),
            })
            .collect())
    }

    fn parameter_tree(&self) -> DriveResult<ParameterTree> {
        Err(DriveError::Parameter(
            "explicit drive lists carry no parameter tree".into(),
        ))
    }
}

/// Parse a drive file, keeping declaration order and applying the group
/// filter (a drive must belong to every filter group to be kept).
fn parse_drives_file(text: &str, group_filter: &[String]) -> DriveResult<Vec<SelectedDrive>> {
    let root: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| DriveError::Parameter(format!("invalid drive file: {}", e)))?;
    let root = root
        .as_mapping()
        .ok_or_else(|| DriveError::Parameter("drive file root must be a mapping".into()))?;

    let mut drives = Vec::new();
    for (name, body) in root {
        let name = name
            .as_str()
            .ok_or_else(|| DriveError::Parameter(format!("drive key {:?} is not a string", name)))?
            .to_string();
        let record: DriveRecord = serde_yaml::from_value(body.clone())
            .map_err(|e| DriveError::Parameter(format!("drive '{}': {}", name, e)))?;

        if !group_filter.iter().all(|g| record.groups.contains(g)) {
            continue;
        }

        let mut endpoint = DriveEndpoint::new(name, record.ip).with_trace(record.trace);
        if let Some(port) = record.port {
            endpoint = endpoint.with_port(port);
        }
        drives.push(SelectedDrive {
            endpoint,
            groups: record.groups,
        });
    }
    Ok(drives)
}

fn load_parameter_file(path: &Path) -> DriveResult<ParameterTree> {
    let text = std::fs::read_to_string(path)?;
    ParameterTree::from_yaml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRIVES: &str = "
axis1:
  ip: 10.0.0.7
  groups: [arm, string1]
axis2:
  ip: 10.0.0.8
  port: 8023
  groups: [arm]
axis3:
  ip: 10.0.0.9
";

    #[test]
    fn test_parse_keeps_declaration_order() {
        let drives = parse_drives_file(DRIVES, &[]).unwrap();
        let names: Vec<&str> = drives.iter().map(|d| d.endpoint.name.as_str()).collect();
        assert_eq!(names, vec!["axis1", "axis2", "axis3"]);
        assert_eq!(drives[1].endpoint.port, 8023);
        assert_eq!(drives[2].endpoint.port, 23);
    }

    #[test]
    fn test_group_filter_requires_all_groups() {
        let arm = parse_drives_file(DRIVES, &["arm".to_string()]).unwrap();
        assert_eq!(arm.len(), 2);

        let both = parse_drives_file(DRIVES, &["arm".to_string(), "string1".to_string()]).unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].endpoint.name, "axis1");
    }

    #[test]
    fn test_explicit_drives_have_no_tree() {
        let source = ExplicitDrives {
            endpoints: vec![DriveEndpoint::new("", "10.0.0.7")],
        };
        assert_eq!(source.selected_drives().unwrap().len(), 1);
        assert!(source.parameter_tree().is_err());
    }

    #[test]
    fn test_malformed_drive_file() {
        assert!(parse_drives_file("- a\n- b\n", &[]).is_err());
        assert!(parse_drives_file("axis1:\n  port: 23\n", &[]).is_err());
    }
}
