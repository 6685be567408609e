//! Build artifacts shipped to the Linux runner
//!
//! `PSWSMan.zip` sits next to the configuration file and is extracted into
//! the PowerShell module directory on the runner. The archive's SHA-256 is
//! stamped into the destination so unchanged archives are neither uploaded
//! nor extracted again.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use testbed_transport::{Script, Transport};
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::recap::{PlayRecap, StepStatus};

pub const PSWSMAN_ARCHIVE: &str = "PSWSMan.zip";

const STAMP_FILE: &str = ".pswsman.sha256";
const STAGING_PATH: &str = "/tmp/testbed-PSWSMan.zip";

const CHECK_STAMP: &str = r#"
if [ -f "$DEST/$STAMP" ] && [ "$(cat "$DEST/$STAMP")" = "$DIGEST" ]; then
    echo current
else
    echo stale
fi
"#;

const EXTRACT: &str = r#"
command -v unzip >/dev/null 2>&1 || { echo "unzip is not installed" >&2; exit 1; }
mkdir -p "$DEST"
unzip -o -q "$ARCHIVE" -d "$DEST"
printf '%s\n' "$DIGEST" > "$DEST/$STAMP"
rm -f "$ARCHIVE"
changed
"#;

/// The PSWSMan archive and its digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PswsmanArchive {
    pub path: PathBuf,
    pub sha256: String,
}

impl PswsmanArchive {
    /// Find the archive next to the config file
    ///
    /// A missing archive is a precondition failure, raised before any host
    /// is contacted.
    pub fn locate(config_dir: &Path) -> Result<Self, ProvisionError> {
        let path = config_dir.join(PSWSMAN_ARCHIVE);
        let bytes = std::fs::read(&path).map_err(|e| {
            ProvisionError::Precondition(format!(
                "{} is required for build_artifacts: {}",
                path.display(),
                e
            ))
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = format!("{:x}", hasher.finalize());
        debug!(archive = %path.display(), sha256 = %sha256, "Located PSWSMan archive");

        Ok(Self { path, sha256 })
    }

    /// Ship and extract the archive unless the same digest is already there
    pub async fn install(
        &self,
        transport: &dyn Transport,
        module_dir: &str,
        recap: &mut PlayRecap,
    ) -> Result<StepStatus, ProvisionError> {
        const STEP: &str = "extract PSWSMan";

        let check = Script::posix(CHECK_STAMP)
            .var("DEST", module_dir)
            .var("STAMP", STAMP_FILE)
            .var("DIGEST", &self.sha256);
        let state = transport
            .run(&check)
            .await
            .map_err(ProvisionError::step(STEP))?
            .payload();
        if state == "current" {
            return Ok(recap.record(STEP, StepStatus::Ok));
        }

        info!(dest = %module_dir, "Installing PSWSMan");
        transport
            .upload(&self.path, STAGING_PATH)
            .await
            .map_err(ProvisionError::step(STEP))?;

        let extract = Script::posix(EXTRACT)
            .var("ARCHIVE", STAGING_PATH)
            .var("DEST", module_dir)
            .var("STAMP", STAMP_FILE)
            .var("DIGEST", &self.sha256);
        let output = transport
            .run(&extract)
            .await
            .map_err(ProvisionError::step(STEP))?;
        Ok(recap.record(STEP, StepStatus::from_changed(output.changed())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_archive_is_precondition() {
        let temp_dir = TempDir::new().unwrap();
        let err = PswsmanArchive::locate(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ProvisionError::Precondition(msg) if msg.contains("PSWSMan.zip")));
    }

    #[test]
    fn test_digest() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(PSWSMAN_ARCHIVE), b"abc").unwrap();

        let archive = PswsmanArchive::locate(temp_dir.path()).unwrap();
        assert_eq!(
            archive.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
