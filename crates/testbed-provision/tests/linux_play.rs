//! Linux play and build artifacts against a scripted host

mod common;

use common::{changed, load_config, seed_certificates, Call, ScriptedTransport};
use tempfile::TempDir;
use testbed_provision::{ProvisionError, Provisioner, StepStatus, Tag, TagSelection};
use testbed_transport::Shell;

const SYNC: &str = "  sync:\n    - src: ./tests\n      dest: /home/vagrant/tests\n";

#[tokio::test]
async fn test_linux_play_on_configured_host() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join("tests")).unwrap();
    let (config, path) = load_config(temp_dir.path(), SYNC);
    let provisioner = Provisioner::new(config, &path).unwrap();

    let windows = ScriptedTransport::new(Shell::PowerShell);
    let linux = ScriptedTransport::new(Shell::Posix);
    let recaps = provisioner
        .run_with(&TagSelection::only([Tag::Linux]), &windows, &linux)
        .await
        .unwrap();

    assert!(windows.calls().is_empty());
    let recap = &recaps[0];
    assert_eq!(recap.host, "test");
    for step in [
        "hosts entry",
        "resolver",
        "packages",
        "docker service",
        "docker group",
        "realm join",
        "sync /home/vagrant/tests",
    ] {
        assert_eq!(recap.status_of(step), Some(StepStatus::Ok), "{}", step);
    }
    assert_eq!(recap.status_of("trust CA"), Some(StepStatus::Skipped));
    assert!(!recap.changed());

    assert_eq!(
        linux.calls().last(),
        Some(&Call::Sync {
            local: temp_dir.path().join("tests"),
            remote: "/home/vagrant/tests".to_string(),
        })
    );
}

#[tokio::test]
async fn test_linux_play_reports_changes() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join("tests")).unwrap();
    let (config, path) = load_config(temp_dir.path(), SYNC);
    let provisioner = Provisioner::new(config, &path).unwrap();

    let windows = ScriptedTransport::new(Shell::PowerShell);
    let linux = ScriptedTransport::new(Shell::Posix)
        .respond("usermod -aG docker", &changed(""))
        .respond("realm join", &changed(""))
        .sync_changes(true);
    let recaps = provisioner
        .run_with(&TagSelection::only([Tag::Linux]), &windows, &linux)
        .await
        .unwrap();

    let recap = &recaps[0];
    assert_eq!(recap.status_of("docker group"), Some(StepStatus::Changed));
    assert_eq!(recap.status_of("realm join"), Some(StepStatus::Changed));
    assert_eq!(
        recap.status_of("sync /home/vagrant/tests"),
        Some(StepStatus::Changed)
    );
    assert_eq!(recap.status_of("hosts entry"), Some(StepStatus::Ok));
    assert_eq!(recap.count(StepStatus::Changed), 3);
}

#[tokio::test]
async fn test_linux_play_points_at_domain_controller() {
    let temp_dir = TempDir::new().unwrap();
    let (config, path) = load_config(temp_dir.path(), "");
    let provisioner = Provisioner::new(config, &path).unwrap();

    let windows = ScriptedTransport::new(Shell::PowerShell);
    let linux = ScriptedTransport::new(Shell::Posix);
    provisioner
        .run_with(&TagSelection::only([Tag::Linux]), &windows, &linux)
        .await
        .unwrap();

    let scripts = linux.scripts();
    let hosts = &scripts[linux.position("/etc/hosts").unwrap()];
    assert!(hosts.contains("ADDRESS='192.168.56.10'\n"));
    assert!(hosts.contains("FQDN='dc01.testbed.local'\n"));
    assert!(hosts.contains("SHORT_NAME='dc01'\n"));

    let join = &scripts[linux.position("realm join").unwrap()];
    assert!(join.contains("DOMAIN='testbed.local'\n"));
    assert!(join.contains("USERNAME='admin'\n"));
}

#[tokio::test]
async fn test_linux_play_trusts_generated_ca() {
    let temp_dir = TempDir::new().unwrap();
    seed_certificates(temp_dir.path(), &["cbt-sha256", "verification"]);
    let (config, path) = load_config(temp_dir.path(), "");
    let provisioner = Provisioner::new(config, &path).unwrap();

    let windows = ScriptedTransport::new(Shell::PowerShell);
    let linux = ScriptedTransport::new(Shell::Posix).respond("update-ca-certificates", &changed(""));
    let recaps = provisioner
        .run_with(&TagSelection::only([Tag::Linux]), &windows, &linux)
        .await
        .unwrap();

    assert_eq!(
        recaps[0].status_of("trust CA"),
        Some(StepStatus::Changed)
    );
    assert!(linux.calls().contains(&Call::Upload {
        local: temp_dir.path().join("cert_setup").join("ca.pem"),
        remote: "/tmp/testbed-ca.pem".to_string(),
    }));
}

#[tokio::test]
async fn test_failed_step_stops_play() {
    let temp_dir = TempDir::new().unwrap();
    let (config, path) = load_config(temp_dir.path(), "");
    let provisioner = Provisioner::new(config, &path).unwrap();

    let windows = ScriptedTransport::new(Shell::PowerShell);
    let linux = ScriptedTransport::new(Shell::Posix).fail(
        "no supported package manager",
        1,
        "no supported package manager (apt-get, dnf)",
    );
    let result = provisioner
        .run_with(&TagSelection::only([Tag::Linux]), &windows, &linux)
        .await;

    match result {
        Err(ProvisionError::Step { step, .. }) => assert_eq!(step, "packages"),
        other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
    }
    assert_eq!(linux.count("systemctl"), 0);
}

#[tokio::test]
async fn test_build_artifacts_installs_pswsman_once() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("PSWSMan.zip"), b"archive").unwrap();
    let (config, path) = load_config(temp_dir.path(), "");
    let provisioner = Provisioner::new(config, &path).unwrap();
    let tags = TagSelection::only([Tag::BuildArtifacts]);

    let windows = ScriptedTransport::new(Shell::PowerShell);
    let fresh = ScriptedTransport::new(Shell::Posix)
        .respond("echo current", "stale")
        .respond("unzip -o", &changed(""));
    let recaps = provisioner.run_with(&tags, &windows, &fresh).await.unwrap();

    assert_eq!(
        recaps[0].status_of("extract PSWSMan"),
        Some(StepStatus::Changed)
    );
    assert_eq!(fresh.uploads(), vec!["/tmp/testbed-PSWSMan.zip".to_string()]);
    assert_eq!(recaps[0].status_of("hosts entry"), None);

    let installed = ScriptedTransport::new(Shell::Posix).respond("echo current", "current");
    let recaps = provisioner
        .run_with(&tags, &windows, &installed)
        .await
        .unwrap();

    assert_eq!(recaps[0].status_of("extract PSWSMan"), Some(StepStatus::Ok));
    assert!(installed.uploads().is_empty());
}
