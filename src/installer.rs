//! KL-020: Tool installation — executable lookup and a single-slot operation guard.
//!
//! Only one install or uninstall runs at a time. A second caller gets
//! [`KilnError::Busy`] immediately instead of waiting.

use crate::core::error::{KilnError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// External infrastructure-as-code tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ToolKind {
    Terraform,
    Bicep,
}

impl ToolKind {
    pub fn binary_name(self) -> &'static str {
        match self {
            ToolKind::Terraform => "terraform",
            ToolKind::Bicep => "bicep",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Supplies a validated executable path for a tool.
pub trait ExecutableLocator: Send + Sync {
    fn get_executable_path(&self, kind: ToolKind, version: Option<&str>) -> Result<PathBuf>;
}

/// Check that `path` is an existing, executable regular file.
pub fn validate_executable(path: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(path).map_err(|_| {
        KilnError::Precondition(format!("executable {} does not exist", path.display()))
    })?;
    if !meta.is_file() {
        return Err(KilnError::Precondition(format!(
            "executable {} is not a regular file",
            path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(KilnError::Precondition(format!(
                "{} is not executable",
                path.display()
            )));
        }
    }
    Ok(path.to_path_buf())
}

/// Locator pinned to one explicit path, regardless of version.
#[derive(Debug, Clone)]
pub struct FixedLocator {
    pub path: PathBuf,
}

impl ExecutableLocator for FixedLocator {
    fn get_executable_path(&self, _kind: ToolKind, _version: Option<&str>) -> Result<PathBuf> {
        validate_executable(&self.path)
    }
}

// ============================================================================
// Single-slot guard
// ============================================================================

/// Observable state of an [`OperationSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
}

/// Admits one operation at a time; excess callers are refused, not queued.
#[derive(Debug)]
pub struct OperationSlot {
    name: &'static str,
    busy: AtomicBool,
}

impl OperationSlot {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SlotState {
        if self.busy.load(Ordering::Acquire) {
            SlotState::Busy
        } else {
            SlotState::Idle
        }
    }

    /// Claim the slot. Released when the guard drops.
    pub fn try_acquire(&self) -> Result<SlotGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| KilnError::Busy(self.name.to_string()))?;
        Ok(SlotGuard { slot: self })
    }
}

/// Holds an [`OperationSlot`] busy.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    slot: &'a OperationSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// A version must be a single plain path component.
fn check_version(version: &str) -> Result<()> {
    let plain = !version.is_empty()
        && version != "."
        && version != ".."
        && !version.contains(['/', '\\'])
        && Path::new(version).components().count() == 1;
    if plain {
        Ok(())
    } else {
        Err(KilnError::Precondition(format!(
            "invalid tool version '{}'",
            version
        )))
    }
}

// ============================================================================
// Installer
// ============================================================================

/// Manages tool binaries under `<root>/<tool>/<version>/<binary>`.
#[derive(Debug)]
pub struct Installer {
    root: PathBuf,
    slot: OperationSlot,
}

impl Installer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slot: OperationSlot::new("installer"),
        }
    }

    pub fn state(&self) -> SlotState {
        self.slot.state()
    }

    pub fn tool_path(&self, kind: ToolKind, version: &str) -> PathBuf {
        self.root
            .join(kind.binary_name())
            .join(version)
            .join(kind.binary_name())
    }

    /// Install a tool binary from a local file. Returns the installed path
    /// and its BLAKE3 hash.
    pub async fn install(
        &self,
        kind: ToolKind,
        version: &str,
        source: &Path,
    ) -> Result<(PathBuf, String)> {
        check_version(version)?;
        let _guard = self.slot.try_acquire()?;
        let dest = self.tool_path(kind, version);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io(parent, e))?;
        }
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| KilnError::io(source, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| KilnError::io(&dest, e))?;
        }
        let hash = crate::tripwire::hasher::hash_file(&dest)?;
        tracing::info!(tool = %kind, version, path = %dest.display(), %hash, "installed");
        Ok((dest, hash))
    }

    /// Remove an installed version.
    pub async fn uninstall(&self, kind: ToolKind, version: &str) -> Result<()> {
        check_version(version)?;
        let _guard = self.slot.try_acquire()?;
        let dir = self.root.join(kind.binary_name()).join(version);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(tool = %kind, version, "uninstalled");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KilnError::Precondition(
                format!("{} {} is not installed", kind, version),
            )),
            Err(e) => Err(KilnError::io(&dir, e)),
        }
    }
}

impl ExecutableLocator for Installer {
    fn get_executable_path(&self, kind: ToolKind, version: Option<&str>) -> Result<PathBuf> {
        let version = version.unwrap_or("latest");
        check_version(version)?;
        validate_executable(&self.tool_path(kind, version)).map_err(|e| {
            KilnError::Precondition(format!("{} {} is not installed: {}", kind, version, e))
        })
    }
}
