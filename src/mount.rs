//! Mount-point resolution for the intercepted workload's filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::TetherError;

/// What the user asked for with `--mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRequest {
    /// `--mount` was not given.
    Unset,
    Disabled,
    /// Mount into a freshly allocated temporary directory.
    Auto,
    Path(PathBuf),
}

impl MountRequest {
    pub fn parse(raw: Option<&str>) -> Result<Self, TetherError> {
        let Some(raw) = raw else {
            return Ok(Self::Unset);
        };
        match raw.trim() {
            "true" => Ok(Self::Auto),
            "false" => Ok(Self::Disabled),
            "" => Err(TetherError::User(
                "--mount requires \"true\", \"false\", or an absolute path".to_string(),
            )),
            path => {
                let path = PathBuf::from(path);
                if !path.is_absolute() {
                    return Err(TetherError::User(format!(
                        "--mount path {} must be absolute",
                        path.display()
                    )));
                }
                Ok(Self::Path(path))
            }
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Auto | Self::Path(_))
    }
}

/// Checks whether remote mounts can be made on this machine.
pub trait MountProbe {
    fn available(&self) -> Result<(), String>;
}

/// Looks for the mount helper executable on `PATH`.
pub struct HelperMountProbe {
    helper: String,
}

impl HelperMountProbe {
    pub fn new(helper: &str) -> Self {
        Self {
            helper: helper.to_string(),
        }
    }
}

impl MountProbe for HelperMountProbe {
    fn available(&self) -> Result<(), String> {
        which::which(&self.helper)
            .map(|_| ())
            .map_err(|_| format!("{} is not installed", self.helper))
    }
}

/// Apply the capability gate to a mount request. An explicit request that
/// cannot be honored is an error; an unset one silently turns mounting off.
pub fn resolve_mount(
    request: MountRequest,
    probe: &dyn MountProbe,
) -> Result<MountRequest, TetherError> {
    if request == MountRequest::Disabled {
        return Ok(MountRequest::Disabled);
    }
    match probe.available() {
        Ok(()) => {
            if let MountRequest::Path(path) = &request {
                if path.exists() && !path.is_dir() {
                    return Err(TetherError::User(format!(
                        "--mount path {} exists and is not a directory",
                        path.display()
                    )));
                }
            }
            Ok(match request {
                MountRequest::Unset => MountRequest::Auto,
                other => other,
            })
        }
        Err(reason) if request.is_explicit() => Err(TetherError::User(format!(
            "remote mounts are unavailable ({reason}); use --mount=false to intercept without mounting"
        ))),
        Err(reason) => {
            debug!(%reason, "mounts disabled");
            Ok(MountRequest::Disabled)
        }
    }
}

/// A mount point made ready on disk, remembering whether we created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub created: bool,
}

impl MountPoint {
    pub fn prepare(request: &MountRequest) -> Result<Option<Self>, TetherError> {
        match request {
            MountRequest::Unset | MountRequest::Disabled => Ok(None),
            MountRequest::Auto => {
                let path = tempfile::Builder::new()
                    .prefix("tether-fs-")
                    .tempdir()?
                    .keep();
                Ok(Some(Self {
                    path,
                    created: true,
                }))
            }
            MountRequest::Path(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let created = match fs::create_dir(path) {
                    Ok(()) => true,
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => false,
                    Err(err) => return Err(err.into()),
                };
                Ok(Some(Self {
                    path: path.clone(),
                    created,
                }))
            }
        }
    }

    pub fn display(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// Remove the directory if we created it and nothing was left in it.
    pub fn cleanup(&self) {
        if !self.created {
            return;
        }
        if is_empty_dir(&self.path) {
            if let Err(err) = fs::remove_dir(&self.path) {
                warn!(path = %self.path.display(), error = %err, "failed to remove mount point");
            }
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct StaticProbe(bool);

    impl MountProbe for StaticProbe {
        fn available(&self) -> Result<(), String> {
            if self.0 {
                Ok(())
            } else {
                Err("sshfs is not installed".to_string())
            }
        }
    }

    #[test]
    fn parses_mount_flag_values() {
        assert_eq!(MountRequest::parse(None).unwrap(), MountRequest::Unset);
        assert_eq!(MountRequest::parse(Some("true")).unwrap(), MountRequest::Auto);
        assert_eq!(
            MountRequest::parse(Some("false")).unwrap(),
            MountRequest::Disabled
        );
        assert_eq!(
            MountRequest::parse(Some("/mnt/x")).unwrap(),
            MountRequest::Path(PathBuf::from("/mnt/x"))
        );
        assert!(MountRequest::parse(Some("relative/dir")).is_err());
    }

    #[test]
    fn missing_helper_disables_unset_mount_silently() {
        let resolved = resolve_mount(MountRequest::Unset, &StaticProbe(false)).unwrap();
        assert_eq!(resolved, MountRequest::Disabled);
    }

    #[test]
    fn missing_helper_rejects_explicit_mount() {
        for request in [MountRequest::Auto, MountRequest::Path(PathBuf::from("/mnt/x"))] {
            let err = resolve_mount(request, &StaticProbe(false)).unwrap_err();
            assert!(err.is_user_error());
            assert!(err.to_string().contains("sshfs is not installed"));
        }
        let resolved = resolve_mount(MountRequest::Disabled, &StaticProbe(false)).unwrap();
        assert_eq!(resolved, MountRequest::Disabled);
    }

    #[test]
    fn available_helper_defaults_to_auto() {
        let resolved = resolve_mount(MountRequest::Unset, &StaticProbe(true)).unwrap();
        assert_eq!(resolved, MountRequest::Auto);
    }

    #[test]
    fn file_in_place_of_mount_dir_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, "x").unwrap();
        let err = resolve_mount(MountRequest::Path(file), &StaticProbe(true)).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn cleanup_only_removes_created_empty_dirs() {
        let dir = tempdir().unwrap();
        let created = dir.path().join("fresh");
        let point = MountPoint::prepare(&MountRequest::Path(created.clone()))
            .unwrap()
            .unwrap();
        assert!(point.created);
        point.cleanup();
        assert!(!created.exists());

        let existing = dir.path().join("existing");
        fs::create_dir(&existing).unwrap();
        let point = MountPoint::prepare(&MountRequest::Path(existing.clone()))
            .unwrap()
            .unwrap();
        assert!(!point.created);
        point.cleanup();
        assert!(existing.exists());

        let used = dir.path().join("used");
        let point = MountPoint::prepare(&MountRequest::Path(used.clone()))
            .unwrap()
            .unwrap();
        fs::write(used.join("file"), "data").unwrap();
        point.cleanup();
        assert!(used.exists());
    }

    #[test]
    fn auto_mount_points_are_distinct_and_fresh() {
        let first = MountPoint::prepare(&MountRequest::Auto).unwrap().unwrap();
        let second = MountPoint::prepare(&MountRequest::Auto).unwrap().unwrap();
        assert_ne!(first.path, second.path);
        assert!(first.created && second.created);
        first.cleanup();
        second.cleanup();
        assert!(!first.path.exists() && !second.path.exists());
    }

    #[test]
    fn auto_mount_allocates_temp_dir() {
        let point = MountPoint::prepare(&MountRequest::Auto).unwrap().unwrap();
        assert!(point.created);
        assert!(point.path.is_dir());
        point.cleanup();
        assert!(!point.path.exists());
    }
}
