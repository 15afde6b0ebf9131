//! End-to-end update flows against a mock CDN and a stub patch tool:
//! fresh install, incremental updates, rescue fallback, repair and
//! channel isolation.

#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(unix)]

mod common;

use common::{mount_base_chain, mount_patch, test_config, tool_invocations, write_flaky_tool, write_stub_tool};
use hytale_content::{BuildRecord, Channel, ContentEngine, PathResolver};
use std::path::Path;
use wiremock::MockServer;

/// Pre-seed an installed build: record on disk plus a client executable
async fn seed_install(root: &Path, channel: Channel, build: u64) {
    let paths = PathResolver::new(root);
    let executable = paths.game_executable(channel);
    tokio::fs::create_dir_all(executable.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&executable, format!("installed build {build}"))
        .await
        .unwrap();

    let record = BuildRecord {
        build,
        channel,
        installed_at: chrono::Utc::now(),
        patched_at: None,
    };
    let map = std::collections::HashMap::from([(channel, record)]);
    tokio::fs::write(
        paths.version_file(),
        serde_json::to_vec_pretty(&map).unwrap(),
    )
    .await
    .unwrap();
}

async fn engine_with_tool(root: &Path, cdn: &str, tool: &Path) -> ContentEngine {
    let mut config = test_config(root, cdn);
    config.tool.tool_path = Some(tool.to_path_buf());
    ContentEngine::new(config).await.unwrap()
}

#[tokio::test]
async fn fresh_install_applies_single_full_patch() {
    // S1: CDN serves full payloads up to build 7 plus one incremental
    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 7).await;
    mount_patch(&server, Channel::Latest, 6, 7, b"incremental 6->7").await;

    let root = tempfile::tempdir().unwrap();
    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    // One tool invocation with the 0->7 payload, nothing incremental
    assert_eq!(tool_invocations(root.path()).await, vec!["0-7.pwr"]);

    let record = engine.build_record(Channel::Latest).await;
    assert_eq!(record.build, 7);

    let executable = engine.paths().game_executable(Channel::Latest);
    assert!(executable.exists(), "client executable must exist");

    // Exactly one body download of 0/7.pwr
    let downloads: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path().ends_with("/0/7.pwr"))
        .collect();
    assert_eq!(downloads.len(), 1);
}

#[tokio::test]
async fn incremental_updates_walk_the_chain() {
    // S2: installed at build 7; CDN adds 7/8 and 8/9
    let server = MockServer::start().await;
    mount_patch(&server, Channel::Latest, 7, 8, b"incremental 7->8").await;
    mount_patch(&server, Channel::Latest, 8, 9, b"incremental 8->9").await;

    let root = tempfile::tempdir().unwrap();
    seed_install(root.path(), Channel::Latest, 7).await;

    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    assert_eq!(
        tool_invocations(root.path()).await,
        vec!["7-8.pwr", "8-9.pwr"],
        "two sequential patch applications"
    );
    assert_eq!(engine.build_record(Channel::Latest).await.build, 9);
}

#[tokio::test]
async fn failed_increment_rescues_with_full_payload() {
    // S3: 7/8 exists but the tool rejects it once; 0/8 recovers
    let server = MockServer::start().await;
    mount_patch(&server, Channel::Latest, 7, 8, b"incremental 7->8").await;
    mount_patch(&server, Channel::Latest, 0, 8, b"full payload for build 8").await;

    let root = tempfile::tempdir().unwrap();
    seed_install(root.path(), Channel::Latest, 7).await;

    let tool = write_flaky_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    assert_eq!(
        tool_invocations(root.path()).await,
        vec!["7-8.pwr", "0-8.pwr"],
        "one failed increment, one rescue, no recursion"
    );
    assert_eq!(engine.build_record(Channel::Latest).await.build, 8);

    let executable = engine.paths().game_executable(Channel::Latest);
    let content = tokio::fs::read(&executable).await.unwrap();
    assert_eq!(
        content, b"full payload for build 8",
        "on-disk state matches a clean install of build 8"
    );
}

#[tokio::test]
async fn up_to_date_install_is_a_noop() {
    let server = MockServer::start().await;

    let root = tempfile::tempdir().unwrap();
    seed_install(root.path(), Channel::Latest, 7).await;

    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    assert!(tool_invocations(root.path()).await.is_empty());
    assert_eq!(engine.build_record(Channel::Latest).await.build, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channels_update_independently() {
    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 3).await;
    mount_base_chain(&server, Channel::Beta, 5).await;

    let root = tempfile::tempdir().unwrap();
    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    let latest = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.install_or_update(Channel::Latest).await })
    };
    let beta = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.install_or_update(Channel::Beta).await })
    };
    latest.await.unwrap().unwrap();
    beta.await.unwrap().unwrap();

    assert_eq!(engine.build_record(Channel::Latest).await.build, 3);
    assert_eq!(engine.build_record(Channel::Beta).await.build, 5);
    assert!(engine.paths().game_executable(Channel::Latest).exists());
    assert!(engine.paths().game_executable(Channel::Beta).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_channel_updates_are_serialized() {
    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 3).await;

    let root = tempfile::tempdir().unwrap();
    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    // Without per-channel mutual exclusion both invocations would race
    // through fresh_install and apply the full payload twice
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.install_or_update(Channel::Latest).await })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.install_or_update(Channel::Latest).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(
        tool_invocations(root.path()).await,
        vec!["0-3.pwr"],
        "the loser of the channel lock must observe the winner's install"
    );
    assert_eq!(engine.build_record(Channel::Latest).await.build, 3);
}

#[tokio::test]
async fn repair_then_update_reinstalls_cleanly() {
    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 4).await;

    let root = tempfile::tempdir().unwrap();
    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();
    assert_eq!(engine.build_record(Channel::Latest).await.build, 4);

    engine.repair(Channel::Latest).await.unwrap();
    assert!(!engine.paths().game_dir(Channel::Latest).exists());
    assert_eq!(engine.build_record(Channel::Latest).await.build, 0);

    engine.install_or_update(Channel::Latest).await.unwrap();
    assert_eq!(
        engine.build_record(Channel::Latest).await.build,
        4,
        "reinstall lands on the highest available base"
    );
    assert!(engine.paths().game_executable(Channel::Latest).exists());
}

#[tokio::test]
async fn missing_executable_forces_fresh_install() {
    // Record claims build 7, but the game directory is empty
    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 7).await;

    let root = tempfile::tempdir().unwrap();
    {
        let paths = PathResolver::new(root.path());
        let record = BuildRecord {
            build: 7,
            channel: Channel::Latest,
            installed_at: chrono::Utc::now(),
            patched_at: None,
        };
        let map = std::collections::HashMap::from([(Channel::Latest, record)]);
        tokio::fs::write(
            paths.version_file(),
            serde_json::to_vec_pretty(&map).unwrap(),
        )
        .await
        .unwrap();
    }

    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    assert_eq!(
        tool_invocations(root.path()).await,
        vec!["0-7.pwr"],
        "ground truth wins: full reinstall instead of trusting the record"
    );
    assert!(engine.paths().game_executable(Channel::Latest).exists());
}

#[tokio::test]
async fn existing_files_without_record_sync_to_latest_base() {
    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 6).await;

    let root = tempfile::tempdir().unwrap();
    // Game files exist, but gameVersion.json does not
    let paths = PathResolver::new(root.path());
    let executable = paths.game_executable(Channel::Latest);
    tokio::fs::create_dir_all(executable.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&executable, b"pre-existing install").await.unwrap();

    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    assert_eq!(
        engine.build_record(Channel::Latest).await.build,
        6,
        "assume-latest-base heuristic records the CDN's newest build"
    );
    assert!(
        tool_invocations(root.path()).await.is_empty(),
        "no patch runs when the record syncs to the latest base"
    );
}

#[tokio::test]
async fn local_archive_override_installs_without_patching() {
    use std::io::Write as _;

    let server = MockServer::start().await;
    mount_base_chain(&server, Channel::Latest, 2).await;

    let root = tempfile::tempdir().unwrap();

    // Drop a game archive into <app>/cdn
    let cdn_dir = root.path().join("cdn");
    tokio::fs::create_dir_all(&cdn_dir).await.unwrap();
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("Client/HytaleClient", zip::write::FileOptions::default())
        .unwrap();
    writer.write_all(b"archived game build").unwrap();
    let archive = writer.finish().unwrap().into_inner();
    tokio::fs::write(cdn_dir.join("game.zip"), archive).await.unwrap();

    let tool = write_stub_tool(root.path()).await;
    let engine = engine_with_tool(root.path(), &server.uri(), &tool).await;

    engine.install_or_update(Channel::Latest).await.unwrap();

    let executable = engine.paths().game_executable(Channel::Latest);
    assert_eq!(
        tokio::fs::read(&executable).await.unwrap(),
        b"archived game build",
        "game comes from the archive, not the CDN"
    );
    assert_eq!(
        engine.build_record(Channel::Latest).await.build,
        2,
        "record synthesized from the CDN's latest base"
    );
    assert!(
        tool_invocations(root.path()).await.is_empty(),
        "no differential patches for an override install"
    );
}
