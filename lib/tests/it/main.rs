//! End-to-end coverage driven entirely through `OtaClient`'s public surface
//! (the crate's `bootctl`/`daemon` internals aren't reachable from an
//! external test crate, nor should a caller need them). Concurrent
//! busy-rejection is already covered by `client.rs`'s own unit tests and
//! isn't duplicated here.

mod fixture;

use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use fixture::{build_manifest_jwt, manifest_payload_json, test_config, AlwaysOk, TestServer};
use otaclient_lib::bootctl::BootController;
use otaclient_lib::client::OtaClient;
use otaclient_lib::error::FailureKind;
use otaclient_lib::manifest::{RegularEntry, Sha256};

fn sha256_of(bytes: &[u8]) -> Sha256 {
    use sha2::{Digest, Sha256 as Sha256Hasher};
    Sha256(Sha256Hasher::digest(bytes).into())
}

fn regular(path: &str, content: &[u8], nlink: u32, inode: Option<u64>) -> RegularEntry {
    RegularEntry {
        mode: 0o644,
        uid: 0,
        gid: 0,
        nlink,
        sha256: sha256_of(content),
        path: path.into(),
        size: Some(content.len() as u64),
        inode,
        compressed: false,
    }
}

fn lines(entries: &[RegularEntry]) -> String {
    entries.iter().map(RegularEntry::to_line).collect::<Vec<_>>().join("\n")
}

#[tokio::test]
async fn fresh_install_downloads_every_regular_file() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let server = TestServer::start().await;

    let content = b"hello from the new image";
    let entry = regular("/usr/bin/foo", content, 1, None);
    let regulars_text = lines(&[entry]);
    server.serve("regulars.txt", regulars_text.clone());
    server.serve("dirs.txt", "");
    server.serve("symlinks.txt", "");
    server.serve("persistents.txt", "");
    server.serve("usr/bin/foo", content.to_vec());

    let payload = manifest_payload_json("", "", &regulars_text, "", false);
    let jwt = build_manifest_jwt(payload);

    let client = OtaClient::new(config.clone(), Arc::new(AlwaysOk));
    client
        .update("http://unused/manifest", &jwt, b"", server.base_url())
        .await
        .expect("fresh install should succeed");

    let installed = config.paths.standby_mount.join("usr/bin/foo");
    assert_eq!(std::fs::read(installed).unwrap(), content);

    let status = client.status().await;
    assert!(!status.busy);
}

#[tokio::test]
async fn reupdate_with_full_overlap_never_touches_the_network_for_content() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let server = TestServer::start().await;

    let content = b"unchanged file, already on the active slot";
    let entry = regular("/usr/bin/foo", content, 1, None);
    let regulars_text = lines(&[entry]);
    server.serve("regulars.txt", regulars_text.clone());
    server.serve("dirs.txt", "");
    server.serve("symlinks.txt", "");
    server.serve("persistents.txt", "");
    // Deliberately never registers "usr/bin/foo": if the builder attempts a
    // download instead of reusing the active-slot copy, the fetch 404s and
    // the whole update fails.
    std::fs::create_dir_all(config.paths.active_root.join("usr/bin")).unwrap();
    std::fs::write(config.paths.active_root.join("usr/bin/foo"), content).unwrap();

    let payload = manifest_payload_json("", "", &regulars_text, "", false);
    let jwt = build_manifest_jwt(payload);

    let client = OtaClient::new(config.clone(), Arc::new(AlwaysOk));
    client
        .update("http://unused/manifest", &jwt, b"", server.base_url())
        .await
        .expect("update should succeed by copying from the active slot");

    let installed = config.paths.standby_mount.join("usr/bin/foo");
    assert_eq!(std::fs::read(installed).unwrap(), content);
}

#[tokio::test]
async fn permanent_404_fails_the_update_and_marks_standby_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let server = TestServer::start().await;

    let content = b"never actually served";
    let entry = regular("/usr/bin/missing", content, 1, None);
    let regulars_text = lines(&[entry]);
    server.serve("regulars.txt", regulars_text.clone());
    server.serve("dirs.txt", "");
    server.serve("symlinks.txt", "");
    server.serve("persistents.txt", "");
    // No active-slot copy and no server route for the content itself: the
    // download 404s, which is non-retryable, so the whole update fails.

    let payload = manifest_payload_json("", "", &regulars_text, "", false);
    let jwt = build_manifest_jwt(payload);

    let client = OtaClient::new(config.clone(), Arc::new(AlwaysOk));
    let err = client
        .update("http://unused/manifest", &jwt, b"", server.base_url())
        .await
        .expect_err("404 should fail the update");
    assert_eq!(err.kind(), FailureKind::Recoverable);

    let installed = config.paths.standby_mount.join("usr/bin/missing");
    assert!(!installed.exists());

    let boot = BootController::from_config(&config);
    // Slot B is standby when Noop's default active slot (A) hasn't changed.
    assert_eq!(boot.read_status("b").unwrap().to_string(), "FAILURE");

    let status = client.status().await;
    assert!(!status.busy);
}

#[tokio::test]
async fn hardlink_group_of_four_shares_one_inode_on_standby() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let server = TestServer::start().await;

    let content = b"shared payload for a hardlink group";
    let paths = ["/usr/share/doc/a", "/usr/share/doc/b", "/usr/share/doc/c", "/usr/share/doc/d"];
    let entries: Vec<RegularEntry> = paths.iter().map(|p| regular(p, content, 4, Some(777))).collect();
    let regulars_text = lines(&entries);
    server.serve("regulars.txt", regulars_text.clone());
    server.serve("dirs.txt", "");
    server.serve("symlinks.txt", "");
    server.serve("persistents.txt", "");
    server.serve("usr/share/doc/a", content.to_vec());

    let payload = manifest_payload_json("", "", &regulars_text, "", false);
    let jwt = build_manifest_jwt(payload);

    let client = OtaClient::new(config.clone(), Arc::new(AlwaysOk));
    client
        .update("http://unused/manifest", &jwt, b"", server.base_url())
        .await
        .expect("hardlink group install should succeed");

    let inodes: Vec<u64> = paths
        .iter()
        .map(|p| std::fs::metadata(config.paths.standby_mount.join(p.trim_start_matches('/'))).unwrap().ino())
        .collect();
    assert_eq!(inodes.iter().collect::<std::collections::HashSet<_>>().len(), 1, "all siblings share one inode");
}

#[tokio::test]
async fn fallback_reboot_is_detected_against_the_last_recorded_slot_in_use() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let boot = BootController::from_config(&config);

    boot.finalize_update("b", "42").unwrap();
    assert!(!boot.detect_fallback("b").unwrap(), "booting the slot we switched to is not a fallback");
    assert!(boot.detect_fallback("a").unwrap(), "booting the old slot after switching to b is a fallback");
}
