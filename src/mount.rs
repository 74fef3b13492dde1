// ============================================
// veeam-server - mount.rs
// ============================================
// Attaching and detaching the installer ISO.
//
// Mount and unmount ALWAYS ask the OS first whether the image is attached
// (Get-DiskImage). The OS can disagree with what we think happened, e.g.
// someone dismounted it by hand mid-run, or an earlier run was killed
// while the image was mounted.
//   - mount:   already attached -> reuse its volume, no Mount-DiskImage
//   - unmount: not attached     -> no Dismount-DiskImage, success
//
// MEDIA GUARD (RAII SAFETY NET)
// Once the ISO is in the cache, MediaGuard owns it. Whatever happens
// next (mount failure, installer failure, early return, panic) the guard
// makes sure the image is unmounted and the cached file cleaned up:
//
// 1. MediaGuard::new(artifact, ...) right after acquisition
// 2. mount/install through guard.artifact_mut()
// 3. guard.release() unmounts + cleans up and returns any errors
// 4. If release() never runs, Drop does the same steps best-effort
// ============================================

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::host::HostContext;
use crate::media::{self, CleanupError, MediaArtifact};
use crate::request::InstallRequest;

/// Why an image could not be mounted, queried or unmounted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("Invalid disc image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    #[error("Failed to mount {path}: {reason}")]
    MountFailed { path: PathBuf, reason: String },

    #[error("Failed to query mount status of {path}: {reason}")]
    StatusQuery { path: PathBuf, reason: String },

    #[error("Failed to dismount {path}: {reason}")]
    DismountFailed { path: PathBuf, reason: String },
}

// ============================================
// MOUNT / UNMOUNT
// ============================================

/// Attach the artifact's ISO and return the root of the mounted volume.
/// An image left attached by an earlier run is reused as it is.
pub fn mount(ctx: &HostContext<'_>, artifact: &mut MediaArtifact) -> Result<PathBuf, MountError> {
    let image = artifact.local_path.as_path();
    check_image(image)?;

    if ctx.images.is_attached(image)? {
        let root = ctx.images.volume_root(image)?;
        warn!(image = %image.display(), root = %root.display(), "installer media already attached, reusing it");
        artifact.mounted = true;
        return Ok(root);
    }

    info!(image = %image.display(), "mounting installer media");
    let root = ctx.images.mount(image)?;
    artifact.mounted = true;
    info!(root = %root.display(), "installer media mounted");
    Ok(root)
}

/// Detach the artifact's ISO if, and only if, the OS reports it attached.
pub fn unmount(ctx: &HostContext<'_>, artifact: &mut MediaArtifact) -> Result<(), MountError> {
    let image = artifact.local_path.as_path();

    if !ctx.images.is_attached(image)? {
        if artifact.mounted {
            warn!(image = %image.display(), "media was mounted this run but is no longer attached");
        } else {
            debug!(image = %image.display(), "media not attached, nothing to unmount");
        }
        artifact.mounted = false;
        return Ok(());
    }

    info!(image = %image.display(), "dismounting installer media");
    ctx.images.dismount(image)?;
    artifact.mounted = false;
    Ok(())
}

/// Reject anything that can't be a mountable ISO before asking the OS.
fn check_image(image: &Path) -> Result<(), MountError> {
    let invalid = |reason: &str| MountError::InvalidImage {
        path: image.to_path_buf(),
        reason: reason.to_string(),
    };

    let is_iso = image
        .extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case("iso"))
        .unwrap_or(false);
    if !is_iso {
        return Err(invalid("not an .iso file"));
    }

    match std::fs::metadata(image) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(invalid("image is empty or not a regular file")),
        Err(e) => Err(invalid(&e.to_string())),
    }
}

// ============================================
// MEDIA GUARD
// ============================================

/// What went wrong while releasing the media.
#[derive(Debug, Default)]
pub struct ReleaseErrors {
    pub unmount: Option<MountError>,
    pub cleanup: Option<CleanupError>,
}

impl ReleaseErrors {
    pub fn is_empty(&self) -> bool {
        self.unmount.is_none() && self.cleanup.is_none()
    }
}

/// Owns the acquired media and guarantees unmount + cleanup.
pub struct MediaGuard<'run, 'ctx> {
    artifact: MediaArtifact,
    ctx: &'run HostContext<'ctx>,
    request: &'run InstallRequest,
    released: bool,
}

impl<'run, 'ctx> MediaGuard<'run, 'ctx> {
    pub fn new(
        artifact: MediaArtifact,
        ctx: &'run HostContext<'ctx>,
        request: &'run InstallRequest,
    ) -> Self {
        MediaGuard { artifact, ctx, request, released: false }
    }

    pub fn artifact(&self) -> &MediaArtifact {
        &self.artifact
    }

    pub fn artifact_mut(&mut self) -> &mut MediaArtifact {
        &mut self.artifact
    }

    /// Unmount, then clean up. Cleanup is attempted even when the unmount
    /// fails. Returns the artifact in its final state plus any errors.
    pub fn release(mut self) -> (MediaArtifact, ReleaseErrors) {
        let errors = self.release_inner();
        self.released = true;
        (self.artifact.clone(), errors)
    }

    fn release_inner(&mut self) -> ReleaseErrors {
        let mut errors = ReleaseErrors::default();
        if let Err(e) = unmount(self.ctx, &mut self.artifact) {
            errors.unmount = Some(e);
        }
        if let Err(e) = media::cleanup(&self.artifact, self.request) {
            errors.cleanup = Some(e);
        }
        errors
    }
}

impl Drop for MediaGuard<'_, '_> {
    /// Error path: release() was never called.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("releasing installer media on an early exit");
        let errors = self.release_inner();
        if let Some(e) = &errors.unmount {
            error!(error = %e, "unmount during early exit failed");
        }
        if let Some(e) = &errors.cleanup {
            error!(error = %e, "cleanup during early exit failed");
        }
    }
}

// ============================================
// TESTS
// ============================================
