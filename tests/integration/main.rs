//! Integration tests for bootcache

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a config that keeps the run inside `dir`
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        r#"
[general]
event_log = false

[lock]
socket_path = "{socket}"
retry_delay_secs = 1
max_retries = 1

[build]
default_archs = ["ppc", "i386"]

[tools.archiver]
program = "/bin/sh"
args = ["-c", "printf 'archive:%s' \"$2\"", "archiver"]
"#,
        socket = dir.join("absent.sock").display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn write_manifest(root: &Path, content: &str, mode: u32) {
    let path = root.join("usr/standalone/bootcaches.toml");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
}

const MANIFEST: &str = r#"
[postboot]
boot_config = "Library/Preferences/com.apple.Boot.plist"

[postboot.mkext]
path = "System/Library/Extensions.mkext"
extensions_dir = "System/Library/Extensions"
"#;

fn populate_volume(root: &Path) {
    write_manifest(root, MANIFEST, 0o644);
    std::fs::create_dir_all(root.join("Library/Preferences")).unwrap();
    std::fs::write(root.join("Library/Preferences/com.apple.Boot.plist"), "<plist/>").unwrap();
    let kext = root.join("System/Library/Extensions/Disk.kext");
    std::fs::create_dir_all(&kext).unwrap();
    std::fs::set_permissions(&kext, std::fs::Permissions::from_mode(0o755)).unwrap();
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn bootcache(config: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("bootcache");
        cmd.arg("--config").arg(config);
        cmd
    }

    fn owner() -> String {
        bootcache::privilege::effective_uid().to_string()
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("bootcache")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("boot-time kernel cache maintenance"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("bootcache")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("bootcache"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        bootcache(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(config.display().to_string()));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        bootcache(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("max_retries = 1"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("etc").join("config.toml");
        bootcache(&config).args(["config", "init"]).assert().success();
        let written = std::fs::read_to_string(&config).unwrap();
        assert!(written.contains("timestamp_offset_secs = 1"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "[lock]\nmax_retries = \"lots\"\n").unwrap();
        bootcache(&config)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn inspect_lists_slices() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        let file = dir.path().join("fat");
        let ppc = bootcache::container::ArchId::from_name("ppc").unwrap();
        let i386 = bootcache::container::ArchId::from_name("i386").unwrap();
        let bytes = bootcache::container::write(&[(ppc, b"ppc".to_vec()), (i386, b"x86".to_vec())]).unwrap();
        std::fs::write(&file, bytes).unwrap();

        bootcache(&config)
            .arg("inspect")
            .arg(&file)
            .args(["--arch", "i386"])
            .assert()
            .success()
            .stdout(predicate::str::contains("multi-architecture"))
            .stdout(predicate::str::contains("[0] ppc"))
            .stdout(predicate::str::contains("Best match for i386: i386"));

        bootcache(&config)
            .arg("inspect")
            .arg(&file)
            .args(["--arch", "arm64"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no slice runs on arm64"));
    }

    #[test]
    fn inspect_truncated_file_is_data_error() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        let file = dir.path().join("short");
        // tagged magic with the slice count cut off
        std::fs::write(&file, [0xca, 0xfe, 0xba, 0xbe, 0x00]).unwrap();

        bootcache(&config)
            .arg("inspect")
            .arg(&file)
            .assert()
            .code(65);
    }

    #[test]
    fn check_without_manifest() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        let root = dir.path().join("volume");
        std::fs::create_dir(&root).unwrap();

        bootcache(&config)
            .arg("check")
            .arg(&root)
            .assert()
            .success()
            .stdout(predicate::str::contains("declares no boot caches"));
    }

    #[test]
    fn writable_manifest_is_untrusted() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        let root = dir.path().join("volume");
        populate_volume(&root);
        write_manifest(&root, MANIFEST, 0o666);

        bootcache(&config)
            .arg("check")
            .arg(&root)
            .args(["--owner", &owner()])
            .assert()
            .code(65)
            .stderr(predicate::str::contains("Untrusted manifest"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn update_then_check_is_current() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        let root = dir.path().join("volume");
        populate_volume(&root);

        bootcache(&config)
            .arg("check")
            .arg(&root)
            .args(["--owner", &owner()])
            .assert()
            .success()
            .stdout(predicate::str::contains("[WARN] Stamps are stale"))
            .stdout(predicate::str::contains("Update needed"));

        bootcache(&config)
            .arg("update")
            .arg(&root)
            .args(["--owner", &owner()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Updated"));

        let mkext = root.join("System/Library/Extensions.mkext");
        bootcache(&config)
            .arg("inspect")
            .arg(&mkext)
            .assert()
            .success()
            .stdout(predicate::str::contains("[1] i386"));

        bootcache(&config)
            .arg("check")
            .arg(&root)
            .args(["--owner", &owner()])
            .assert()
            .success()
            .stdout(predicate::str::contains("[OK] Stamps are current"))
            .stdout(predicate::str::contains("Boot caches are current"));

        bootcache(&config)
            .arg("update")
            .arg(&root)
            .args(["--owner", &owner()])
            .assert()
            .success()
            .stdout(predicate::str::contains("up to date"));
    }

    #[test]
    fn build_with_variant() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        let root = dir.path().join("volume");
        populate_volume(&root);
        let output = dir.path().join("Extensions.mkext");

        bootcache(&config)
            .args(["build", "--kind", "mkext", "--arch", "ppc", "--variant", "release"])
            .arg("--output")
            .arg(&output)
            .arg("--modules")
            .arg(root.join("System/Library/Extensions"))
            .args(["--owner", &owner()])
            .assert()
            .success()
            .stdout(predicate::str::contains("built ppc"));

        let expected = bootcache::builder::variant_path(&output, "release");
        // single slice is written untagged
        assert_eq!(std::fs::read(expected).unwrap(), b"archive:ppc");
    }

    #[test]
    fn build_without_archiver_explains() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "[general]\nevent_log = false\n").unwrap();
        let modules = dir.path().join("Extensions");
        std::fs::create_dir(&modules).unwrap();

        bootcache(&config)
            .args(["build", "--kind", "mkext", "--arch", "ppc"])
            .arg("--output")
            .arg(dir.path().join("out.mkext"))
            .arg("--modules")
            .arg(&modules)
            .assert()
            .failure()
            .stderr(predicate::str::contains("No archiver configured"));
    }
}

mod library_tests {
    use super::*;
    use bootcache::builder::{BuildOptions, CacheBuilder, Collaborators};
    use bootcache::config::schema::{ToolCommand, ToolsConfig};
    use bootcache::events::EventLog;
    use bootcache::lock::{NoCoordinator, VolumeLock};
    use bootcache::manifest::ManifestTrust;
    use bootcache::update::{update_volume, UpdateContext, UpdateOptions, UpdateOutcome};
    use bootcache::volume::Volume;
    use std::sync::Arc;

    #[tokio::test]
    async fn update_volume_with_command_archiver() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("volume");
        populate_volume(&root);
        let uid = bootcache::privilege::effective_uid();

        let tools = ToolsConfig {
            linker: None,
            archiver: Some(ToolCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec![
                    "-c".to_string(),
                    "printf '%s' \"$2\"".to_string(),
                    "archiver".to_string(),
                ],
            }),
        };
        let builder = CacheBuilder::new(Collaborators::from_config(&tools, uid), BuildOptions::default());
        let lock = VolumeLock::new(Arc::new(NoCoordinator), Default::default());
        let events = EventLog::at(dir.path().join("events.log"));
        let ctx = UpdateContext {
            builder: &builder,
            lock: &lock,
            events: &events,
        };
        let options = UpdateOptions {
            force: false,
            trust: ManifestTrust { owner_uid: uid },
            default_archs: vec![bootcache::container::ArchId::from_name("x86_64").unwrap()],
        };

        let volume = Volume::probe(&root).unwrap();
        match update_volume(&volume, &options, &ctx).await.unwrap() {
            UpdateOutcome::Updated { built, stamps, .. } => {
                assert_eq!(built.len(), 1);
                assert_eq!(stamps, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            std::fs::read(root.join("System/Library/Extensions.mkext")).unwrap(),
            b"x86_64"
        );

        let log = std::fs::read_to_string(events.path()).unwrap();
        let kinds: Vec<String> = log
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .map(|v| v["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "lock.acquired",
                "rebuild.started",
                "rebuild.finished",
                "stamps.committed",
                "lock.released"
            ]
        );

        assert_eq!(
            update_volume(&volume, &options, &ctx).await.unwrap(),
            UpdateOutcome::UpToDate
        );
    }
}
