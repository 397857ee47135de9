//! Disk-image and install-media tool contracts.
//!
//! Image creation and unattended-install ISO generation are external
//! collaborators; the lifecycle paths only see these traits. A qemu-img
//! backed implementation ships for the common case.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::UnattendedInstall;
use crate::core::runner::{SystemRunner, expect_success};
use crate::error::{Error, Result};

/// Creates and inspects disk images.
pub trait ImageTool: Send + Sync {
    /// Create an image of `size_gb` gigabytes. Pre-existing files are a
    /// hard error; per-VM image names must not collide.
    fn create_image(&self, path: &Path, size_gb: u32, format: &str) -> Result<()>;
}

/// Shells out to `qemu-img`.
pub struct QemuImgTool {
    runner: Arc<dyn SystemRunner>,
    binary: String,
}

impl std::fmt::Debug for QemuImgTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QemuImgTool")
            .field("binary", &self.binary)
            .finish()
    }
}

impl QemuImgTool {
    pub fn new(runner: Arc<dyn SystemRunner>) -> Self {
        Self {
            runner,
            binary: "qemu-img".to_string(),
        }
    }
}

impl ImageTool for QemuImgTool {
    fn create_image(&self, path: &Path, size_gb: u32, format: &str) -> Result<()> {
        if path.exists() {
            return Err(Error::DiskError {
                message: format!("image {} already exists", path.display()),
            });
        }
        let size = format!("{size_gb}G");
        let rendered = path.display().to_string();
        let args = [
            "create",
            "-f",
            format,
            "-o",
            "preallocation=metadata",
            rendered.as_str(),
            size.as_str(),
        ];
        let output = self
            .runner
            .run(&self.binary, &args)
            .map_err(|err| Error::DiskError {
                message: format!("failed to spawn {}: {err}", self.binary),
            })?;
        expect_success(&self.binary, &args, &output).map_err(|message| Error::DiskError {
            message,
        })
    }
}

/// Generates unattended-installation media.
pub trait MediaBuilder: Send + Sync {
    /// Produce a bootable answer-file ISO; returns its path.
    fn build_install_iso(&self, request: &UnattendedInstall, output_dir: &Path)
    -> Result<PathBuf>;
}

/// Placeholder used when no media builder is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMediaBuilder;

impl MediaBuilder for NoMediaBuilder {
    fn build_install_iso(
        &self,
        request: &UnattendedInstall,
        _output_dir: &Path,
    ) -> Result<PathBuf> {
        Err(Error::InvalidConfig {
            message: format!(
                "unattended install for `{}` requested but no media builder is configured",
                request.os
            ),
        })
    }
}
