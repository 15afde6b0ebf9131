//! CDN version discovery
//!
//! Probes the patch URL tree to find the highest available base build and
//! the next incremental patch for an installed build. Probes are HEAD
//! requests with a short timeout, falling back to a ranged GET for
//! servers that mishandle HEAD; a probe never downloads a file body.
//!
//! Patch files live at `<base>/<os>/<arch>/<cdn_channel>/<from>/<to>.pwr`
//! where `<from> == 0` marks a full payload.

use crate::config::CdnConfig;
use crate::error::Result;
use crate::types::{Channel, PatchInfo};
use tracing::{debug, info, warn};

/// Version discovery over a CDN patch tree
#[derive(Clone)]
pub struct VersionProbe {
    client: reqwest::Client,
    base_url: String,
    max_search: u64,
}

impl VersionProbe {
    /// Create a probe for the configured CDN
    pub fn new(config: &CdnConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_search: config.max_search,
        })
    }

    /// URL-tree path of a patch, relative to the CDN base
    pub fn patch_path(channel: Channel, from_build: u64, to_build: u64) -> String {
        let (os, arch) = platform_keys();
        format!(
            "{os}/{arch}/{}/{from_build}/{to_build}.pwr",
            channel.cdn_channel()
        )
    }

    /// Absolute URL of a patch file
    pub fn patch_url(&self, channel: Channel, from_build: u64, to_build: u64) -> String {
        format!(
            "{}/{}",
            self.base_url,
            Self::patch_path(channel, from_build, to_build)
        )
    }

    /// Probe for the incremental patch on top of `current`
    ///
    /// Returns `Some(PatchInfo)` when `<current>/<current+1>.pwr` exists.
    pub async fn find_next_patch(
        &self,
        channel: Channel,
        current: u64,
    ) -> Result<Option<PatchInfo>> {
        let next = current + 1;
        let url = self.patch_url(channel, current, next);
        if self.probe(&url).await {
            debug!(channel = %channel, from = current, to = next, "incremental patch available");
            Ok(Some(PatchInfo::new(current, next, url)))
        } else {
            Ok(None)
        }
    }

    /// Find the highest base build available on the CDN
    ///
    /// Sanity-probes `0/1.pwr` first; when absent the channel has no
    /// builds at all. Otherwise binary-searches `[1, max_search]` for the
    /// largest `N` with `0/N.pwr` present, using `O(log max_search)`
    /// probes.
    pub async fn find_latest_base(&self, channel: Channel) -> Result<Option<PatchInfo>> {
        if !self.probe(&self.patch_url(channel, 0, 1)).await {
            warn!(channel = %channel, "no base builds found on CDN");
            return Ok(None);
        }

        let mut lo = 1u64;
        let mut hi = self.max_search;
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.probe(&self.patch_url(channel, 0, mid)).await {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        info!(channel = %channel, latest = lo, "latest base build discovered");
        let url = self.patch_url(channel, 0, lo);
        Ok(Some(PatchInfo::new(0, lo, url)))
    }

    /// Existence probe: HEAD first, ranged GET as fallback
    ///
    /// Any 2xx is success; every other outcome is failure. The ranged GET
    /// asks for a single byte so no body is transferred either way.
    async fn probe(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                debug!(url, status = %response.status(), "HEAD probe failed, retrying with GET");
            }
            Err(e) => {
                debug!(url, error = %e, "HEAD probe errored, retrying with GET");
            }
        }

        match self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "GET probe errored");
                false
            }
        }
    }
}

/// OS and architecture keys as the CDN names them
fn platform_keys() -> (&'static str, &'static str) {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    };

    let arch = if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "amd64"
    };

    (os, arch)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn probe_for(server: &MockServer, max_search: u64) -> VersionProbe {
        let config = CdnConfig {
            base_url: server.uri(),
            max_search,
            probe_timeout: Duration::from_secs(8),
        };
        VersionProbe::new(&config).unwrap()
    }

    /// Mount HEAD 200s for every full patch `0/N.pwr` with `N <= latest`
    async fn mount_bases(server: &MockServer, channel: Channel, latest: u64) {
        for build in 1..=latest {
            Mock::given(method("HEAD"))
                .and(path(format!(
                    "/{}",
                    VersionProbe::patch_path(channel, 0, build)
                )))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;
        }
    }

    #[test]
    fn patch_path_shape() {
        let p = VersionProbe::patch_path(Channel::Latest, 0, 7);
        assert!(p.ends_with("/release/0/7.pwr"), "unexpected path: {p}");

        let p = VersionProbe::patch_path(Channel::Beta, 7, 8);
        assert!(p.ends_with("/pre-release/7/8.pwr"), "unexpected path: {p}");
    }

    #[tokio::test]
    async fn next_patch_found_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path(format!(
                "/{}",
                VersionProbe::patch_path(Channel::Latest, 7, 8)
            )))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = probe_for(&server, 100);
        let next = probe.find_next_patch(Channel::Latest, 7).await.unwrap();

        let info = next.expect("patch should be found");
        assert_eq!(info.from_build, 7);
        assert_eq!(info.to_build, 8);
        assert!(!info.is_full);
    }

    #[tokio::test]
    async fn next_patch_none_when_absent() {
        let server = MockServer::start().await;
        let probe = probe_for(&server, 100);
        let next = probe.find_next_patch(Channel::Latest, 7).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn latest_base_none_on_empty_cdn() {
        let server = MockServer::start().await;
        let probe = probe_for(&server, 100);
        let latest = probe.find_latest_base(Channel::Latest).await.unwrap();
        assert!(latest.is_none());
    }

    #[tokio::test]
    async fn latest_base_finds_highest_build() {
        let server = MockServer::start().await;
        mount_bases(&server, Channel::Latest, 7).await;

        let probe = probe_for(&server, 100);
        let latest = probe.find_latest_base(Channel::Latest).await.unwrap();

        let info = latest.expect("bases exist");
        assert_eq!(info.to_build, 7);
        assert_eq!(info.from_build, 0);
        assert!(info.is_full);
    }

    #[tokio::test]
    async fn latest_base_independent_of_max_search() {
        for max_search in [10, 100, 1000] {
            let server = MockServer::start().await;
            mount_bases(&server, Channel::Latest, 5).await;

            let probe = probe_for(&server, max_search);
            let latest = probe.find_latest_base(Channel::Latest).await.unwrap();
            assert_eq!(
                latest.unwrap().to_build,
                5,
                "wrong result with max_search={max_search}"
            );
        }
    }

    #[tokio::test]
    async fn latest_base_at_search_boundary() {
        let server = MockServer::start().await;
        mount_bases(&server, Channel::Latest, 8).await;

        // Exactly the upper bound of the search window
        let probe = probe_for(&server, 8);
        let latest = probe.find_latest_base(Channel::Latest).await.unwrap();
        assert_eq!(latest.unwrap().to_build, 8);
    }

    #[tokio::test]
    async fn binary_search_uses_logarithmic_probes() {
        let server = MockServer::start().await;
        mount_bases(&server, Channel::Latest, 6).await;

        let probe = probe_for(&server, 100);
        probe.find_latest_base(Channel::Latest).await.unwrap();

        // Each probe is at most a HEAD + a fallback GET. With a linear
        // sweep this would be hundreds of requests; the binary search
        // needs ~log2(100) probes plus the sanity check.
        let requests = server.received_requests().await.unwrap();
        assert!(
            requests.len() <= 2 * 10,
            "expected O(log) probes, saw {} requests",
            requests.len()
        );
    }

    #[tokio::test]
    async fn head_failure_falls_back_to_ranged_get() {
        let server = MockServer::start().await;
        let patch_path = format!("/{}", VersionProbe::patch_path(Channel::Latest, 7, 8));

        // HEAD is broken on this server, GET works
        Mock::given(method("HEAD"))
            .and(path(patch_path.clone()))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(patch_path))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![0u8]))
            .mount(&server)
            .await;

        let probe = probe_for(&server, 100);
        let next = probe.find_next_patch(Channel::Latest, 7).await.unwrap();
        assert!(next.is_some(), "ranged GET fallback should succeed");
    }

    #[tokio::test]
    async fn beta_channel_probes_pre_release_tree() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path(format!(
                "/{}",
                VersionProbe::patch_path(Channel::Beta, 3, 4)
            )))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = probe_for(&server, 100);
        assert!(probe
            .find_next_patch(Channel::Beta, 3)
            .await
            .unwrap()
            .is_some());
        // The release tree stays untouched for the beta channel
        assert!(probe
            .find_next_patch(Channel::Latest, 3)
            .await
            .unwrap()
            .is_none());
    }
}
