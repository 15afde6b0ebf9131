//! Shared fixtures: a mock CDN patch tree and stub patch tools.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use hytale_content::{Channel, EngineConfig, RetryConfig, VersionProbe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Engine configuration pointed at a mock CDN, tuned for fast tests
pub fn test_config(root: &Path, cdn_base: &str) -> EngineConfig {
    let mut config = EngineConfig::new(root);
    config.cdn.base_url = cdn_base.to_string();
    config.cdn.max_search = 20;
    config.cdn.probe_timeout = Duration::from_secs(2);
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
    };
    config
}

/// Mount one patch file on the mock CDN (HEAD probe + GET download)
pub async fn mount_patch(server: &MockServer, channel: Channel, from: u64, to: u64, body: &[u8]) {
    let patch_path = format!("/{}", VersionProbe::patch_path(channel, from, to));
    Mock::given(method("HEAD"))
        .and(path(patch_path.clone()))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(patch_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

/// Mount the full-payload chain `0/1 .. 0/latest` for a channel
pub async fn mount_base_chain(server: &MockServer, channel: Channel, latest: u64) {
    for build in 1..=latest {
        mount_patch(
            server,
            channel,
            0,
            build,
            format!("full payload for build {build}").as_bytes(),
        )
        .await;
    }
}

#[cfg(unix)]
async fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, body).await.unwrap();
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .unwrap();
}

/// A stub differential tool: records each invocation in `<dir>/tool.log`
/// and "installs" by copying the patch blob over the client executable.
#[cfg(unix)]
pub async fn write_stub_tool(dir: &Path) -> PathBuf {
    let tool = dir.join("stub-butler.sh");
    let log = dir.join("tool.log");
    write_script(
        &tool,
        &format!(
            "#!/bin/sh\n\
             echo \"$3\" >> {log}\n\
             mkdir -p \"$4/Client\"\n\
             cp \"$3\" \"$4/Client/HytaleClient\"\n\
             exit 0\n",
            log = log.display()
        ),
    )
    .await;
    tool
}

/// A stub tool that fails its first invocation and succeeds afterwards
#[cfg(unix)]
pub async fn write_flaky_tool(dir: &Path) -> PathBuf {
    let tool = dir.join("flaky-butler.sh");
    let log = dir.join("tool.log");
    let marker = dir.join("flaky.marker");
    write_script(
        &tool,
        &format!(
            "#!/bin/sh\n\
             echo \"$3\" >> {log}\n\
             if [ ! -f {marker} ]; then\n\
                 touch {marker}\n\
                 echo 'patch signature rejected' >&2\n\
                 exit 2\n\
             fi\n\
             mkdir -p \"$4/Client\"\n\
             cp \"$3\" \"$4/Client/HytaleClient\"\n\
             exit 0\n",
            log = log.display(),
            marker = marker.display()
        ),
    )
    .await;
    tool
}

/// Patch blob names the stub tool was invoked with, in order
pub async fn tool_invocations(dir: &Path) -> Vec<String> {
    match tokio::fs::read_to_string(dir.join("tool.log")).await {
        Ok(raw) => raw
            .lines()
            .map(|line| {
                Path::new(line)
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}
