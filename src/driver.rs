//! Installed Chrome detection and matching chromedriver download.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::FetchOutcome;
use crate::error::SyncError;
use crate::fetch::Fetcher;
use crate::fs_util;
use crate::store;

pub const MILESTONES_URL: &str = "https://googlechromelabs.github.io/chrome-for-testing/latest-versions-per-milestone-with-downloads.json";

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)\.(\d+)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChromeVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub patch: u32,
}

impl fmt::Display for ChromeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.patch)
    }
}

impl FromStr for ChromeVersion {
    type Err = SyncError;

    /// Finds the first dotted four-part version anywhere in `value`, so raw
    /// `--version` output parses directly.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = VERSION_PATTERN
            .captures(value)
            .ok_or_else(|| SyncError::ChromeVersion(value.trim().to_string()))?;
        let part = |index: usize| {
            caps[index]
                .parse::<u32>()
                .map_err(|err| SyncError::ChromeVersion(err.to_string()))
        };
        Ok(Self {
            major: part(1)?,
            minor: part(2)?,
            build: part(3)?,
            patch: part(4)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPlatform {
    Linux64,
    MacX64,
    MacArm64,
    Win32,
    Win64,
}

impl DriverPlatform {
    pub fn current() -> Result<Self, SyncError> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Ok(DriverPlatform::Linux64),
            ("macos", "aarch64") => Ok(DriverPlatform::MacArm64),
            ("macos", _) => Ok(DriverPlatform::MacX64),
            ("windows", "x86") => Ok(DriverPlatform::Win32),
            ("windows", _) => Ok(DriverPlatform::Win64),
            (os, arch) => Err(SyncError::UnsupportedPlatform(format!("{os}/{arch}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DriverPlatform::Linux64 => "linux64",
            DriverPlatform::MacX64 => "mac-x64",
            DriverPlatform::MacArm64 => "mac-arm64",
            DriverPlatform::Win32 => "win32",
            DriverPlatform::Win64 => "win64",
        }
    }

    pub fn binary_name(self) -> &'static str {
        match self {
            DriverPlatform::Win32 | DriverPlatform::Win64 => "chromedriver.exe",
            _ => "chromedriver",
        }
    }
}

/// Version of the locally installed Chrome browser.
pub fn installed_chrome_version() -> Result<ChromeVersion, SyncError> {
    let output = match std::env::consts::OS {
        "linux" => run_version_command("google-chrome", &["--version"])?,
        "macos" => run_version_command(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            &["--version"],
        )?,
        "windows" => run_version_command(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "(Get-Item (Get-ItemProperty 'HKLM:\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\App Paths\\chrome.exe').'(Default)').VersionInfo.FileVersion",
            ],
        )?,
        other => return Err(SyncError::UnsupportedPlatform(other.to_string())),
    };
    let version = output.parse()?;
    debug!(%version, "installed chrome detected");
    Ok(version)
}

fn run_version_command(program: &str, args: &[&str]) -> Result<String, SyncError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| SyncError::ChromeVersion(format!("{program}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SyncError::ChromeVersion(stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[derive(Debug, Deserialize)]
pub struct MilestoneIndex {
    pub milestones: BTreeMap<String, Milestone>,
}

#[derive(Debug, Deserialize)]
pub struct Milestone {
    pub version: String,
    #[serde(default)]
    pub downloads: Downloads,
}

#[derive(Debug, Default, Deserialize)]
pub struct Downloads {
    #[serde(default)]
    pub chromedriver: Vec<DownloadLink>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadLink {
    pub platform: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRelease {
    pub version: String,
    pub url: String,
}

/// Picks the chromedriver build published for `version`'s milestone.
pub fn select_release(
    index: &MilestoneIndex,
    version: ChromeVersion,
    platform: DriverPlatform,
) -> Result<DriverRelease, SyncError> {
    let milestone = index
        .milestones
        .get(&version.major.to_string())
        .ok_or_else(|| SyncError::DriverNotFound(format!("Chrome {}", version.major)))?;
    let link = milestone
        .downloads
        .chromedriver
        .iter()
        .find(|link| link.platform == platform.as_str())
        .ok_or_else(|| {
            SyncError::DriverNotFound(format!(
                "Chrome {} on {}",
                version.major,
                platform.as_str()
            ))
        })?;
    Ok(DriverRelease {
        version: milestone.version.clone(),
        url: link.url.clone(),
    })
}

pub struct DriverResolver<'a, F: Fetcher> {
    fetcher: &'a F,
    index_url: String,
}

impl<'a, F: Fetcher> DriverResolver<'a, F> {
    pub fn new(fetcher: &'a F) -> Self {
        Self::with_index_url(fetcher, MILESTONES_URL)
    }

    pub fn with_index_url(fetcher: &'a F, index_url: &str) -> Self {
        Self {
            fetcher,
            index_url: index_url.to_string(),
        }
    }

    pub fn resolve(
        &self,
        version: ChromeVersion,
        platform: DriverPlatform,
    ) -> Result<DriverRelease, SyncError> {
        let FetchOutcome::Found(body) = self.fetcher.fetch_page(&self.index_url)? else {
            return Err(SyncError::DriverNotFound(format!(
                "index unavailable at {}",
                self.index_url
            )));
        };
        let index: MilestoneIndex =
            serde_json::from_str(&body).map_err(|err| SyncError::Http(err.to_string()))?;
        select_release(&index, version, platform)
    }

    /// Downloads the release archive, extracts it and places the driver
    /// binary in `dest_dir`. Returns the installed binary path.
    pub fn install(
        &self,
        release: &DriverRelease,
        platform: DriverPlatform,
        dest_dir: &Path,
    ) -> Result<PathBuf, SyncError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("manifest-sync-driver")
            .tempdir()
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let zip_path = temp_dir.path().join("chromedriver.zip");

        info!(url = %release.url, "downloading chromedriver");
        if !self.fetcher.fetch_file(&release.url, &zip_path)?.is_found() {
            return Err(SyncError::DriverNotFound(release.url.clone()));
        }

        fs_util::validate_zip(&zip_path)?;
        let extract_dir = temp_dir.path().join("extract");
        let files = fs_util::extract_zip(&zip_path, &extract_dir)?;
        let binary = files
            .iter()
            .find(|path| {
                path.file_name()
                    .map(|name| name == platform.binary_name())
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                SyncError::DriverNotFound(format!("{} missing from archive", platform.binary_name()))
            })?;

        store::ensure_dir(dest_dir)?;
        let target = dest_dir.join(platform.binary_name());
        fs::copy(binary, &target).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs_util::make_executable(&target)?;
        info!(path = %target.display(), version = %release.version, "chromedriver installed");
        Ok(target)
    }
}

/// Detects the installed Chrome and installs the matching chromedriver into
/// `dest_dir`.
pub fn download_chrome_driver<F: Fetcher>(
    fetcher: &F,
    dest_dir: &Path,
) -> Result<PathBuf, SyncError> {
    let version = installed_chrome_version()?;
    let platform = DriverPlatform::current()?;
    let resolver = DriverResolver::new(fetcher);
    let release = resolver.resolve(version, platform)?;
    resolver.install(&release, platform, dest_dir)
}
