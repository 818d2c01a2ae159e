use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// Spawn options read from a YAML profile. Every field is optional; flags
/// given on the command line take precedence.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpawnProfile {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub clear_env: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: Vec<u32>,
    pub setsid: bool,
    pub pgid: Option<i32>,
    pub capture: bool,
}

/// Load a profile from a YAML file.
///
/// A relative `cwd` is resolved against the profile file's parent directory.
pub async fn load(path: &Path) -> CliResult<SpawnProfile> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::Config(format!("read {}: {e}", path.display())))?;
    let mut profile: SpawnProfile = serde_yaml_ng::from_str(&content)
        .map_err(|e| CliError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(profile_dir) = path.parent() {
        profile.resolve_relative_paths(profile_dir);
    }
    Ok(profile)
}

impl SpawnProfile {
    fn resolve_relative_paths(&mut self, profile_dir: &Path) {
        if let Some(cwd) = &mut self.cwd
            && cwd.is_relative()
        {
            *cwd = profile_dir.join(&*cwd);
        }
    }

    /// Overlay command-line values. Scalars given on the command line replace
    /// the profile's; `env` entries are merged with the command line winning;
    /// boolean switches can only be turned on.
    pub fn merge(mut self, flags: SpawnProfile) -> Self {
        if flags.cwd.is_some() {
            self.cwd = flags.cwd;
        }
        self.env.extend(flags.env);
        self.clear_env |= flags.clear_env;
        self.uid = flags.uid.or(self.uid);
        self.gid = flags.gid.or(self.gid);
        if !flags.groups.is_empty() {
            self.groups = flags.groups;
        }
        self.setsid |= flags.setsid;
        self.pgid = flags.pgid.or(self.pgid);
        self.capture |= flags.capture;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_full_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        let yaml = "\
cwd: /srv/work
env:
  LANG: C
clear_env: true
uid: 1000
gid: 1000
groups: [10, 20]
setsid: true
capture: true
";
        tokio::fs::write(&path, yaml).await.unwrap();

        let profile = load(&path).await.unwrap();
        assert_eq!(
            profile,
            SpawnProfile {
                cwd: Some(PathBuf::from("/srv/work")),
                env: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
                clear_env: true,
                uid: Some(1000),
                gid: Some(1000),
                groups: vec![10, 20],
                setsid: true,
                pgid: None,
                capture: true,
            }
        );
    }

    #[tokio::test]
    async fn relative_cwd_resolves_against_profile_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        tokio::fs::write(&path, "cwd: data\n").await.unwrap();

        let profile = load(&path).await.unwrap();
        assert_eq!(profile.cwd, Some(dir.path().join("data")));
    }

    #[tokio::test]
    async fn unknown_field_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        tokio::fs::write(&path, "cwdir: /tmp\n").await.unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, CliError::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_file_is_a_config_error() {
        let err = load(Path::new("/nonexistent/profile.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/profile.yaml"));
    }

    #[test]
    fn flags_override_profile() {
        let profile = SpawnProfile {
            cwd: Some(PathBuf::from("/from/profile")),
            env: BTreeMap::from([
                ("A".to_string(), "profile".to_string()),
                ("B".to_string(), "profile".to_string()),
            ]),
            uid: Some(1),
            groups: vec![1, 2],
            setsid: true,
            ..SpawnProfile::default()
        };
        let flags = SpawnProfile {
            env: BTreeMap::from([("A".to_string(), "flag".to_string())]),
            uid: Some(2),
            gid: Some(3),
            ..SpawnProfile::default()
        };

        let merged = profile.merge(flags);
        assert_eq!(merged.cwd, Some(PathBuf::from("/from/profile")));
        assert_eq!(merged.env["A"], "flag");
        assert_eq!(merged.env["B"], "profile");
        assert_eq!(merged.uid, Some(2));
        assert_eq!(merged.gid, Some(3));
        assert_eq!(merged.groups, vec![1, 2]);
        assert!(merged.setsid);
    }
}
