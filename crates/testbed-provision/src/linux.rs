//! Linux test runner play

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use testbed_transport::{Script, Transport};
use tracing::{info, info_span, Instrument};

use crate::config::{resolve_path, TestbedConfig};
use crate::error::ProvisionError;
use crate::recap::{PlayRecap, StepStatus};

const HOSTS_ENTRY: &str = r#"
LINE="$ADDRESS $FQDN $SHORT_NAME"
if grep -qxF "$LINE" /etc/hosts; then
    exit 0
fi
tmp=$(mktemp)
awk -v fqdn="$FQDN" '{ for (i = 2; i <= NF; i++) if ($i == fqdn) next; print }' /etc/hosts > "$tmp"
printf '%s\n' "$LINE" >> "$tmp"
cat "$tmp" > /etc/hosts
rm -f "$tmp"
changed
"#;

const RESOLVER_HEAD: &str = r#"
WANT="nameserver $ADDRESS"
if [ -f "$HEAD" ] && [ "$(cat "$HEAD")" = "$WANT" ]; then
    exit 0
fi
mkdir -p "$(dirname "$HEAD")"
printf '%s\n' "$WANT" > "$HEAD"
if command -v resolvconf >/dev/null 2>&1; then
    resolvconf -u || true
fi
changed
"#;

const PACKAGES: &str = r#"
missing=""
if command -v apt-get >/dev/null 2>&1; then
    for pkg in $PACKAGES; do
        if ! dpkg-query -W -f='${Status}' "$pkg" 2>/dev/null | grep -q "install ok installed"; then
            missing="$missing $pkg"
        fi
    done
    if [ -n "$missing" ]; then
        export DEBIAN_FRONTEND=noninteractive
        apt-get update -q
        apt-get install -y -q $missing
        changed
    fi
elif command -v dnf >/dev/null 2>&1; then
    for pkg in $PACKAGES; do
        if ! rpm -q "$pkg" >/dev/null 2>&1; then
            missing="$missing $pkg"
        fi
    done
    if [ -n "$missing" ]; then
        dnf install -y $missing
        changed
    fi
else
    echo "no supported package manager (apt-get, dnf)" >&2
    exit 1
fi
"#;

const DOCKER_SERVICE: &str = r#"
if ! systemctl is-enabled --quiet docker; then
    systemctl enable docker
    changed
fi
if ! systemctl is-active --quiet docker; then
    systemctl start docker
    changed
fi
"#;

const DOCKER_GROUP: &str = r#"
if id -nG "$RUNTIME_USER" | tr ' ' '\n' | grep -qx docker; then
    exit 0
fi
usermod -aG docker "$RUNTIME_USER"
changed
"#;

const REALM_JOIN: &str = r#"
if realm list --name-only 2>/dev/null | grep -qixF "$DOMAIN"; then
    exit 0
fi
printf '%s' "$PASSWORD" | realm join --user="$USERNAME" "$DOMAIN"
changed
"#;

const CA_TRUST: &str = r#"
DEST="$TRUST_DIR/testbed-ca.crt"
if [ -f "$DEST" ] && cmp -s "$SRC" "$DEST"; then
    rm -f "$SRC"
    exit 0
fi
mkdir -p "$TRUST_DIR"
install -m 0644 "$SRC" "$DEST"
rm -f "$SRC"
if command -v update-ca-certificates >/dev/null 2>&1; then
    update-ca-certificates
else
    update-ca-trust extract
fi
changed
"#;

const CA_STAGING_PATH: &str = "/tmp/testbed-ca.pem";

/// Configures the Docker test runner
pub struct LinuxPlay<'a> {
    transport: &'a dyn Transport,
    config: &'a TestbedConfig,
    config_dir: &'a Path,
    ca_pem: Option<PathBuf>,
}

impl<'a> LinuxPlay<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a TestbedConfig, config_dir: &'a Path) -> Self {
        Self {
            transport,
            config,
            config_dir,
            ca_pem: None,
        }
    }

    /// CA bundle to add to the system trust store
    pub fn with_ca(mut self, ca_pem: impl Into<PathBuf>) -> Self {
        self.ca_pem = Some(ca_pem.into());
        self
    }

    pub async fn run(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        let span = info_span!("linux", host = %self.transport.target());
        self.run_steps(recap).instrument(span).await
    }

    async fn run_steps(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        let linux = &self.config.linux;
        let dc_address: Ipv4Addr = self.config.windows.address;
        let dc_fqdn = self.config.windows_fqdn();

        let hosts = Script::posix(HOSTS_ENTRY)
            .var("ADDRESS", dc_address.to_string())
            .var("FQDN", &dc_fqdn)
            .var("SHORT_NAME", self.config.windows.hostname.to_lowercase());
        self.step(recap, "hosts entry", &hosts).await?;

        let resolver = Script::posix(RESOLVER_HEAD)
            .var("ADDRESS", dc_address.to_string())
            .var("HEAD", &linux.resolver_head);
        self.step(recap, "resolver", &resolver).await?;

        let packages = Script::posix(PACKAGES).list("PACKAGES", linux.packages.iter().cloned());
        self.step(recap, "packages", &packages).await?;

        self.step(recap, "docker service", &Script::posix(DOCKER_SERVICE))
            .await?;

        let group = Script::posix(DOCKER_GROUP).var("RUNTIME_USER", &linux.runtime_user);
        self.step(recap, "docker group", &group).await?;

        let join = Script::posix(REALM_JOIN)
            .var("DOMAIN", &self.config.domain.name)
            .var("USERNAME", &self.config.domain.username)
            .var("PASSWORD", self.config.domain.password());
        self.step(recap, "realm join", &join).await?;

        self.trust_ca(recap).await?;
        self.sync(recap).await?;
        Ok(())
    }

    async fn trust_ca(&self, recap: &mut PlayRecap) -> Result<StepStatus, ProvisionError> {
        const STEP: &str = "trust CA";

        let Some(ca_pem) = &self.ca_pem else {
            info!("No CA bundle available, skipping trust store");
            return Ok(recap.record(STEP, StepStatus::Skipped));
        };

        self.transport
            .upload(ca_pem, CA_STAGING_PATH)
            .await
            .map_err(ProvisionError::step(STEP))?;
        let script = Script::posix(CA_TRUST)
            .var("SRC", CA_STAGING_PATH)
            .var("TRUST_DIR", &self.config.linux.ca_trust_dir);
        self.step(recap, STEP, &script).await
    }

    async fn sync(&self, recap: &mut PlayRecap) -> Result<(), ProvisionError> {
        for entry in &self.config.linux.sync {
            let step = format!("sync {}", entry.dest);
            let src = resolve_path(self.config_dir, &entry.src);
            let transferred = self
                .transport
                .sync_dir(&src, &entry.dest)
                .await
                .map_err(ProvisionError::step(&step))?;
            recap.record(step, StepStatus::from_changed(transferred));
        }
        Ok(())
    }

    async fn step(
        &self,
        recap: &mut PlayRecap,
        name: &str,
        script: &Script,
    ) -> Result<StepStatus, ProvisionError> {
        let output = self
            .transport
            .run(script)
            .await
            .map_err(ProvisionError::step(name))?;
        Ok(recap.record(name, StepStatus::from_changed(output.changed())))
    }
}
