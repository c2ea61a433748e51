//! Parameter synchronization: hierarchical resolution, live diffing, and
//! applying the result to a drive.
//!
//! The source of truth is a hierarchical tree: groups carry shared
//! parameter blocks, drives carry their own overrides. A drive's
//! *effective parameter map* is resolved by applying, in order, the block
//! of every group the drive belongs to (in tree declaration order), then
//! the drive's own overrides. Later writes shadow earlier ones.
//!
//! Comparison against a drive's live state (or a saved file) never uses
//! exact float equality: the device stores floats with limited precision,
//! so numeric values match within an absolute tolerance of
//! [`COMPARE_TOLERANCE`].

pub mod file;

use std::collections::HashSet;

use log::warn;

use crate::error::{DriveError, DriveResult};
use crate::protocol::{DriveSession, Value};

/// Reserved key the resolved map seeds with the drive's own name. Applied
/// first so every later log line and saved file carries the right name.
pub const DRIVE_NAME_KEY: &str = "drv.name";

/// Observed device float storage precision.
pub const COMPARE_TOLERANCE: f64 = 0.003;

/// Ordered parameter map: iteration follows first-insertion order and a
/// re-insert replaces the value in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamMap {
    entries: Vec<(String, Value)>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. The original insertion position is kept, so
    /// group ordering survives drive-level overrides.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Value)> for ParamMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut map = ParamMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// The hierarchical parameter tree, declaration order preserved.
#[derive(Clone, Debug, Default)]
pub struct ParameterTree {
    groups: Vec<(String, ParamMap)>,
    drives: Vec<(String, ParamMap)>,
}

impl ParameterTree {
    /// Parse a tree from YAML text:
    ///
    /// ```yaml
    /// groups:
    ///   arm:
    ///     parameters:
    ///       IL.KP: 120.5
    /// drives:
    ///   axis1:
    ///     IL.KP: 140
    /// ```
    pub fn from_yaml(text: &str) -> DriveResult<Self> {
        let root: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| DriveError::Parameter(format!("invalid parameter tree: {}", e)))?;
        if !root.is_mapping() {
            return Err(DriveError::Parameter(
                "parameter tree root must be a mapping".into(),
            ));
        }

        let mut tree = ParameterTree::default();

        if let Some(groups) = root.get("groups") {
            let groups = groups.as_mapping().ok_or_else(|| {
                DriveError::Parameter("'groups' must be a mapping of group names".into())
            })?;
            for (name, body) in groups {
                let name = mapping_key(name)?;
                if !body.is_mapping() {
                    return Err(DriveError::Parameter(format!(
                        "group '{}' must be a mapping",
                        name
                    )));
                }
                let params = match body.get("parameters") {
                    Some(p) => param_block(p, &format!("group '{}'", name))?,
                    None => ParamMap::new(),
                };
                tree.groups.push((name, params));
            }
        }

        if let Some(drives) = root.get("drives") {
            let drives = drives.as_mapping().ok_or_else(|| {
                DriveError::Parameter("'drives' must be a mapping of drive names".into())
            })?;
            for (name, body) in drives {
                let name = mapping_key(name)?;
                let params = param_block(body, &format!("drive '{}'", name))?;
                tree.drives.push((name, params));
            }
        }

        Ok(tree)
    }

    pub fn group(&self, name: &str) -> Option<&ParamMap> {
        self.groups
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    pub fn drive_overrides(&self, name: &str) -> Option<&ParamMap> {
        self.drives
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    /// Group names in declaration order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(n, _)| n.as_str())
    }
}

fn mapping_key(key: &serde_yaml::Value) -> DriveResult<String> {
    key.as_str()
        .map(str::to_string)
        .ok_or_else(|| DriveError::Parameter(format!("mapping key {:?} is not a string", key)))
}

fn param_block(value: &serde_yaml::Value, context: &str) -> DriveResult<ParamMap> {
    let mapping = value.as_mapping().ok_or_else(|| {
        DriveError::Parameter(format!("{} parameters must be a mapping", context))
    })?;
    let mut params = ParamMap::new();
    for (name, value) in mapping {
        let name = mapping_key(name)?;
        params.insert(name, yaml_scalar(value, context)?);
    }
    Ok(params)
}

fn yaml_scalar(value: &serde_yaml::Value, context: &str) -> DriveResult<Value> {
    match value {
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(DriveError::Parameter(format!(
                    "{}: unsupported number {:?}",
                    context, n
                )))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_yaml::Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        other => Err(DriveError::Parameter(format!(
            "{}: parameter values must be scalars, got {:?}",
            context, other
        ))),
    }
}

/// Resolve a drive's effective parameter map from the tree.
///
/// `member_groups` is the drive's group membership as listed in the drive
/// registry file. Group blocks apply in tree declaration order, then the
/// drive's own overrides; last write wins.
pub fn resolve(
    drive_name: &str,
    member_groups: &[String],
    tree: &ParameterTree,
) -> DriveResult<ParamMap> {
    for group in member_groups {
        if tree.group(group).is_none() {
            warn!(
                "drive {} belongs to group '{}' which has no parameter block",
                drive_name, group
            );
        }
    }

    let mut map = ParamMap::new();
    map.insert(DRIVE_NAME_KEY, Value::Text(drive_name.to_string()));

    for (group_name, params) in &tree.groups {
        if member_groups.iter().any(|g| g == group_name) {
            for (name, value) in params.iter() {
                map.insert(name, value.clone());
            }
        }
    }

    if let Some(overrides) = tree.drive_overrides(drive_name) {
        for (name, value) in overrides.iter() {
            map.insert(name, value.clone());
        }
    }

    Ok(map)
}

/// One parameter whose current value deviates from the wanted one.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangedParam {
    pub name: String,
    pub current: Value,
    pub wanted: Value,
}

/// Result of comparing a drive's state against an effective map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamDiff {
    /// Wanted parameters absent from the comparison source.
    pub new: Vec<(String, Value)>,
    /// Comparison-source parameters not present in the effective map.
    pub missing: Vec<String>,
    /// Present on both sides but with differing values.
    pub changed: Vec<ChangedParam>,
}

impl ParamDiff {
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.missing.is_empty() && self.changed.is_empty()
    }
}

/// Compare a source (live drive state or saved file) against the effective
/// map. Numeric values match within [`COMPARE_TOLERANCE`]; string values
/// require an exact match.
pub fn compare(source: &ParamMap, effective: &ParamMap) -> ParamDiff {
    let mut diff = ParamDiff::default();
    let mut visited: HashSet<&str> = HashSet::new();

    for (name, wanted) in effective.iter() {
        match source.get(name) {
            None => diff.new.push((name.to_string(), wanted.clone())),
            Some(current) => {
                visited.insert(name);
                if !values_match(current, wanted, COMPARE_TOLERANCE) {
                    diff.changed.push(ChangedParam {
                        name: name.to_string(),
                        current: current.clone(),
                        wanted: wanted.clone(),
                    });
                }
            }
        }
    }

    for (name, _) in source.iter() {
        if !visited.contains(name) {
            diff.missing.push(name.to_string());
        }
    }

    diff
}

fn values_match(a: &Value, b: &Value, tolerance: f64) -> bool {
    if let (Value::Text(x), Value::Text(y)) = (a, b) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() <= tolerance,
        _ => a.to_string() == b.to_string(),
    }
}

/// Read the drive's non-default parameter list as a comparison source.
pub async fn live_params(session: &mut DriveSession) -> DriveResult<ParamMap> {
    Ok(session
        .non_default_params()
        .await?
        .into_iter()
        .map(|p| (p.name, Value::classify(&p.value)))
        .collect())
}

/// Write an effective map to a drive: optional factory reset first, then
/// the drive-name parameter, then everything else in map order. The first
/// failed set aborts this drive's apply; the fleet executor isolates it.
pub async fn apply(
    session: &mut DriveSession,
    effective: &ParamMap,
    factory_reset: bool,
) -> DriveResult<usize> {
    if factory_reset {
        session.factory_reset().await?;
    }

    let mut written = 0;
    if let Some(name) = effective.get(DRIVE_NAME_KEY) {
        session.set(DRIVE_NAME_KEY, name.clone()).await?;
        written += 1;
    }
    for (name, value) in effective.iter() {
        if name == DRIVE_NAME_KEY {
            continue;
        }
        session.set(name, value.clone()).await?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = "
groups:
  arm:
    parameters:
      IL.KP: 120.5
      VL.KP: 8
  conveyor:
    parameters:
      VL.KP: 9
      MOTOR.NAME: BELT
drives:
  axis1:
    IL.KP: 140
";

    #[test]
    fn test_resolve_group_then_override() {
        let tree = ParameterTree::from_yaml(TREE).unwrap();
        let map = resolve("axis1", &["arm".to_string()], &tree).unwrap();

        assert_eq!(map.get(DRIVE_NAME_KEY), Some(&Value::Text("axis1".into())));
        // Drive-level override beats the group value.
        assert_eq!(map.get("IL.KP"), Some(&Value::Int(140)));
        assert_eq!(map.get("VL.KP"), Some(&Value::Int(8)));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let tree = ParameterTree::from_yaml(TREE).unwrap();
        let groups = vec!["arm".to_string(), "conveyor".to_string()];
        let a = resolve("axis1", &groups, &tree).unwrap();
        let b = resolve("axis1", &groups, &tree).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_resolve_later_group_shadows_earlier() {
        let tree = ParameterTree::from_yaml(TREE).unwrap();
        let groups = vec!["conveyor".to_string(), "arm".to_string()];
        // Membership order is irrelevant; tree declaration order rules, so
        // conveyor's VL.KP (declared second) wins.
        let map = resolve("axis2", &groups, &tree).unwrap();
        assert_eq!(map.get("VL.KP"), Some(&Value::Int(9)));
        assert_eq!(map.get("MOTOR.NAME"), Some(&Value::Text("BELT".into())));
    }

    #[test]
    fn test_override_beats_group_regardless_of_order() {
        let tree = ParameterTree::from_yaml(TREE).unwrap();
        for groups in [
            vec!["arm".to_string(), "conveyor".to_string()],
            vec!["conveyor".to_string(), "arm".to_string()],
        ] {
            let map = resolve("axis1", &groups, &tree).unwrap();
            assert_eq!(map.get("IL.KP"), Some(&Value::Int(140)));
        }
    }

    #[test]
    fn test_param_map_keeps_first_insertion_position() {
        let mut map = ParamMap::new();
        map.insert("a", Value::Int(1));
        map.insert("b", Value::Int(2));
        map.insert("a", Value::Int(3));
        let order: Vec<&str> = map.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert_eq!(map.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_compare_within_tolerance_matches() {
        let mut effective = ParamMap::new();
        effective.insert("PL.KP", Value::Float(1.000));
        let mut source = ParamMap::new();
        source.insert("PL.KP", Value::classify("0.998"));

        assert!(compare(&source, &effective).is_clean());
    }

    #[test]
    fn test_compare_outside_tolerance_changes() {
        let mut effective = ParamMap::new();
        effective.insert("PL.KP", Value::Float(1.000));
        let mut source = ParamMap::new();
        source.insert("PL.KP", Value::classify("0.995"));

        let diff = compare(&source, &effective);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].name, "PL.KP");
    }

    #[test]
    fn test_compare_new_and_missing() {
        let mut effective = ParamMap::new();
        effective.insert("IL.KP", Value::Int(120));
        let mut source = ParamMap::new();
        source.insert("VL.KP", Value::Int(8));

        let diff = compare(&source, &effective);
        assert_eq!(diff.new, vec![("IL.KP".to_string(), Value::Int(120))]);
        assert_eq!(diff.missing, vec!["VL.KP".to_string()]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_compare_strings_exact() {
        let mut effective = ParamMap::new();
        effective.insert("MOTOR.NAME", Value::Text("SM742E".into()));
        let mut source = ParamMap::new();
        source.insert("MOTOR.NAME", Value::Text("SM742E ".into()));

        let diff = compare(&source, &effective);
        assert_eq!(diff.changed.len(), 1);
    }

    #[test]
    fn test_tree_rejects_non_scalar_value() {
        let err = ParameterTree::from_yaml("drives:\n  a:\n    X: [1, 2]\n").unwrap_err();
        assert!(matches!(err, DriveError::Parameter(_)));
    }
}
