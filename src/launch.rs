use std::path::{Path, PathBuf};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A host path made visible inside the container.
#[derive(Clone, Debug)]
pub struct BindMount {
    pub src: PathBuf,
    pub dst: PathBuf,
}

/// A tmpfs instance mounted inside the container.
#[derive(Clone, Debug)]
pub struct TmpfsMount {
    pub options: String,
    pub dst: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    oldroot: Option<PathBuf>,
    work_dir: PathBuf,
    maps: Vec<BindMount>,
    vols: Vec<BindMount>,
    tmpfs: Vec<TmpfsMount>,
    permit_writable: bool,
    command: Vec<String>,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn rootfs(mut self, oldroot: impl Into<PathBuf>) -> Self {
        self.oldroot = Some(oldroot.into());
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn map(mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        self.maps.push(BindMount {
            src: src.into(),
            dst: dst.into(),
        });
        self
    }

    pub fn vol(mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        self.vols.push(BindMount {
            src: src.into(),
            dst: dst.into(),
        });
        self
    }

    pub fn tmpfs(mut self, options: impl ToString, dst: impl Into<PathBuf>) -> Self {
        self.tmpfs.push(TmpfsMount {
            options: options.to_string(),
            dst: dst.into(),
        });
        self
    }

    pub fn permit_writable(mut self, permit_writable: bool) -> Self {
        self.permit_writable = permit_writable;
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn create(self) -> Result<LaunchConfig, Error> {
        if self.command.is_empty() {
            return Err("Launch command should specified".into());
        }
        let oldroot = self.oldroot.unwrap_or_else(|| "/".into());
        let work_dir = if !self.work_dir.as_os_str().is_empty() {
            self.work_dir
        } else {
            "/".into()
        };
        check_destinations("--map", &self.maps, |v| &v.dst)?;
        check_destinations("--vol", &self.vols, |v| &v.dst)?;
        check_destinations("--tmpfs", &self.tmpfs, |v| &v.dst)?;
        let has_tmp = self
            .maps
            .iter()
            .map(|v| &v.dst)
            .chain(self.vols.iter().map(|v| &v.dst))
            .chain(self.tmpfs.iter().map(|v| &v.dst))
            .any(|v| v == Path::new("/tmp"));
        Ok(LaunchConfig {
            oldroot,
            work_dir,
            maps: self.maps,
            vols: self.vols,
            tmpfs: self.tmpfs,
            permit_writable: self.permit_writable,
            has_tmp,
            command: self.command,
        })
    }
}

fn check_destinations<T>(
    option: &str,
    mounts: &[T],
    dst_of: impl Fn(&T) -> &PathBuf,
) -> Result<(), Error> {
    for mount in mounts {
        let dst = dst_of(mount);
        if !dst.is_absolute() {
            return Err(format!(
                "{option} destinations must be absolute: {}",
                dst.display()
            )
            .into());
        }
    }
    Ok(())
}

/// Immutable description of one launch, read-only in the child.
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub oldroot: PathBuf,
    pub work_dir: PathBuf,
    pub maps: Vec<BindMount>,
    pub vols: Vec<BindMount>,
    pub tmpfs: Vec<TmpfsMount>,
    pub permit_writable: bool,
    pub has_tmp: bool,
    pub command: Vec<String>,
}

impl LaunchConfig {
    pub fn options() -> LaunchOptions {
        LaunchOptions::new()
    }
}
